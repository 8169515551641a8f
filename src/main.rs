use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rabbilite::config::load_config;
use rabbilite::{json_handler, Consumer, Producer};

const JOBS_QUEUE: &str = "jobs";

#[derive(Debug, Serialize, Deserialize)]
struct Job {
    id: u64,
    val: String,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config().context("failed to load configuration")?;

    let consumer = Consumer::from_config(&config)
        .await
        .context("consumer could not connect")?;
    let handle = consumer
        .start_consuming(
            JOBS_QUEUE,
            json_handler(|job: Job| {
                info!(id = job.id, "Processing job: {}", job.val);
                Ok(())
            }),
        )
        .await?;

    let producer = Producer::from_config(&config)
        .await
        .context("producer could not connect")?;
    producer
        .send_message(JOBS_QUEUE, &Job { id: 1, val: "a".to_string() })
        .await?;

    info!("Service running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;

    let summary = handle.shutdown().await?;
    info!(
        acked = summary.acked,
        requeued = summary.requeued,
        rejected = summary.rejected,
        "Consumer stopped"
    );

    producer.close().await?;
    consumer.close().await?;
    Ok(())
}
