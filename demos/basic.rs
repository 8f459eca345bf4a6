use async_trait::async_trait;
use cadence_scheduler::{Handler, NewJob, Scheduler, SchedulerConfig, StoreKind};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::level_filters::LevelFilter;

struct MyJob;

#[async_trait]
impl Handler for MyJob {
    async fn handle(&self, data: Value) -> anyhow::Result<()> {
        println!("payload: {data}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set MONGODB_URI to run against MongoDB, otherwise jobs stay in memory.
    let config = match std::env::var("MONGODB_URI") {
        Ok(uri) => SchedulerConfig {
            store: StoreKind::MongoDb,
            uri: Some(uri),
            ..Default::default()
        },
        Err(_) => SchedulerConfig::default(),
    };
    let config = SchedulerConfig {
        dev: std::env::var("CADENCE_DEV").is_ok(),
        ..config
    };

    let subscriber =
        tracing_subscriber::fmt().with_max_level(LevelFilter::from(config.log_level));
    if config.dev {
        subscriber
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .init();
    } else {
        subscriber.init();
    }

    let scheduler = Scheduler::new(config).await?;
    scheduler.add_template("my_job", MyJob);
    scheduler.start().await?;

    // Runs on the next tick, then every two seconds.
    scheduler
        .add_job(
            NewJob::new("my_job")
                .with_id("my-job-0")
                .with_data(json!([1, 2, 3]))
                .repeat_every(Duration::from_secs(2)),
        )
        .await?;

    // One-shot job, removed after it runs.
    scheduler
        .add_job(NewJob::new("my_job").with_data(json!("once")))
        .await?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    scheduler.stop().await?;
    Ok(())
}
