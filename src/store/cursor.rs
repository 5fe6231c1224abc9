//! Lazy, page-by-page iteration over ordered store queries.
//!
//! A [`ChunkedCursor`] never holds more than one page of results. Large results
//! can be split into independent sub-cursors over disjoint offset ranges and
//! scanned concurrently.
//!
//! # Features
//!
//! - **Lazy paging**: each page is a fresh bounded query at the next offset
//! - **Parallel split**: two or four sub-cursors depending on the result size
//! - **Memoized size**: the count query runs at most once per cursor

use crate::config::CursorConfig;
use crate::error::AnvilResult;
use async_trait::async_trait;
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;

/// An ordered, offset-addressable query result.
#[async_trait]
pub trait PageSource<T>: Send + Sync {
    /// Total number of rows in the result
    async fn count(&self) -> AnvilResult<u64>;

    /// Rows `[offset, offset + limit)` in result order
    async fn fetch(&self, offset: u64, limit: u64) -> AnvilResult<Vec<T>>;
}

/// Resumable enumerator over a [`PageSource`].
pub struct ChunkedCursor<T> {
    source: Option<Arc<dyn PageSource<T>>>,
    config: CursorConfig,
    /// Absolute offset range for sub-cursors
    range: Option<(u64, u64)>,
    size: Option<u64>,
    position: u64,
    buffer: VecDeque<T>,
    exhausted: bool,
}

impl<T: Send + 'static> ChunkedCursor<T> {
    /// Cursor over the whole of `source`.
    pub fn new(source: Arc<dyn PageSource<T>>, config: CursorConfig) -> Self {
        Self {
            source: Some(source),
            config,
            range: None,
            size: None,
            position: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn bounded(source: Arc<dyn PageSource<T>>, config: CursorConfig, start: u64, end: u64) -> Self {
        Self {
            source: Some(source),
            config,
            range: Some((start, end)),
            size: Some(end - start),
            position: start,
            buffer: VecDeque::new(),
            exhausted: start >= end,
        }
    }

    /// Number of rows this cursor covers.
    pub async fn size(&mut self) -> AnvilResult<u64> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let size = match &self.source {
            Some(source) => source.count().await?,
            None => 0,
        };
        self.size = Some(size);
        Ok(size)
    }

    /// Whether [`ChunkedCursor::into_parallel`] would split this cursor.
    pub async fn can_do_parallel(&mut self) -> AnvilResult<bool> {
        if self.range.is_some() || self.source.is_none() {
            return Ok(false);
        }
        Ok(self.size().await? >= self.config.parallel_threshold)
    }

    /// Split into sub-cursors over disjoint ranges.
    ///
    /// Small results come back as a single cursor (`self`).
    pub async fn into_parallel(mut self) -> AnvilResult<Vec<Self>> {
        if !self.can_do_parallel().await? {
            return Ok(vec![self]);
        }
        let Some(source) = self.source.take() else {
            return Ok(vec![self]);
        };

        let total = self.size().await?;
        let chunks = if total <= self.config.four_way_threshold { 2 } else { 4 };
        let chunk_size = total.div_ceil(chunks);

        let cursors = (0..chunks)
            .map(|i| (i * chunk_size, ((i + 1) * chunk_size).min(total)))
            .filter(|(start, end)| start < end)
            .map(|(start, end)| Self::bounded(Arc::clone(&source), self.config, start, end))
            .collect();

        tracing::debug!(total, chunks, chunk_size, "Split cursor for parallel scan");
        Ok(cursors)
    }

    /// Next row, fetching a new page when the buffer runs dry.
    pub async fn next(&mut self) -> AnvilResult<Option<T>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.exhausted {
                self.close();
                return Ok(None);
            }
            let Some(source) = self.source.as_ref().map(Arc::clone) else {
                return Ok(None);
            };

            let limit = match self.range {
                Some((_, end)) => self.config.page_size.min(end.saturating_sub(self.position)),
                None => self.config.page_size,
            };
            if limit == 0 {
                self.exhausted = true;
                continue;
            }

            let page = source.fetch(self.position, limit).await?;
            let fetched = page.len() as u64;
            self.position += fetched;

            // A short page means the result ended early
            if fetched < limit {
                self.exhausted = true;
            }
            if let Some((_, end)) = self.range {
                if self.position >= end {
                    self.exhausted = true;
                }
            }
            self.buffer.extend(page);
        }
    }

    /// Release the buffer and the underlying source.
    pub fn close(&mut self) {
        self.source = None;
        self.buffer.clear();
        self.exhausted = true;
    }

    /// Whether the cursor has been closed or fully consumed.
    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    /// Drain the remaining rows into a vector.
    pub async fn collect_all(mut self) -> AnvilResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Adapt into a [`Stream`]. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = AnvilResult<T>> + Send {
        futures::stream::unfold(self, |mut cursor| async move {
            match cursor.next().await {
                Ok(Some(item)) => Some((Ok(item), cursor)),
                Ok(None) => None,
                Err(err) => {
                    cursor.close();
                    Some((Err(err), cursor))
                }
            }
        })
    }
}

impl<T> std::fmt::Debug for ChunkedCursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedCursor")
            .field("range", &self.range)
            .field("size", &self.size)
            .field("position", &self.position)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Page source over an owned, already ordered vector.
pub struct VecSource<T> {
    items: Vec<T>,
}

impl<T> VecSource<T> {
    /// Wrap `items`, which must already be in result order.
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> PageSource<T> for VecSource<T> {
    async fn count(&self) -> AnvilResult<u64> {
        Ok(self.items.len() as u64)
    }

    async fn fetch(&self, offset: u64, limit: u64) -> AnvilResult<Vec<T>> {
        let start = (offset as usize).min(self.items.len());
        let end = start.saturating_add(limit as usize).min(self.items.len());
        Ok(self.items[start..end].to_vec())
    }
}
