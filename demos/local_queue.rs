use anvilq::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloTask {
    pub name: String,
    pub message: String,
}

struct Greeter {
    worker: &'static str,
}

#[async_trait]
impl TaskHandler<HelloTask> for Greeter {
    async fn handle(&self, consumer: &ConsumerHandle<HelloTask>, task: Task<HelloTask>) -> Result<(), HandlerError> {
        println!("👋 [{}] Hello {}: {}", self.worker, task.payload.name, task.payload.message);
        tokio::time::sleep(Duration::from_millis(500)).await;
        println!("✅ [{}] Task completed for {}", self.worker, task.payload.name);

        consumer.acknowledge(task.id).await?;
        consumer.ready().await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AnvilConfig::development();
    config.producer = ProducerConfig::bind("127.0.0.1:0");
    init_tracing(&config.logging);

    let anvil: Anvil<HelloTask> = Anvil::new(config.clone()).await?;
    // Only one greeting runs at a time, however many workers are connected
    anvil.engine().set_rate_limit("greeting", 1).await?;
    anvil.start().await?;

    let address = anvil.local_addr().await.ok_or("producer is not listening")?;
    println!("🔨 Anvil listening on {address}");

    let names = ["Ada", "Grace", "Linus", "Barbara"];
    let tasks = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let task = Task::new(
                "hello",
                HelloTask {
                    name: name.to_string(),
                    message: "Welcome to anvilq".to_string(),
                },
            )
            .with_priority(i as i32);
            // Every other task is rate limited
            if i % 2 == 0 { task.with_tag("greeting") } else { task }
        })
        .collect();
    anvil.submit_all(tasks).await?;

    let consumer_config = config.consumer.clone();
    let consumers = [
        Consumer::new(
            ConsumerConfig {
                host_address: address.to_string(),
                ..consumer_config.clone()
            },
            Greeter { worker: "worker-1" },
        ),
        Consumer::new(
            ConsumerConfig {
                host_address: address.to_string(),
                ..consumer_config
            },
            Greeter { worker: "worker-2" },
        ),
    ];
    for consumer in &consumers {
        consumer.connect().await?;
    }

    while anvil.engine().size().await? > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!(
        "📊 All tasks done, estimated duration of 'hello': {}ms",
        anvil.engine().task_type_estimate("hello").await?
    );

    for consumer in &consumers {
        consumer.close().await;
    }
    anvil.shutdown().await?;
    println!("🔨 Anvil stopped");
    Ok(())
}
