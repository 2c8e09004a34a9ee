//! Consume a Kafka topic in size- or time-bounded batches.
use anyhow::Context;
use batch_consumer::batch::Batch;
use batch_consumer::config::ConsumerConfig;
use batch_consumer::handler::handler_fn;
use batch_consumer::service::BatchService;
use envconfig::Envconfig;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

mod config;
mod endpoints;

async fn log_batch(batch: Batch<String>) -> anyhow::Result<()> {
    info!(size = batch.len(), "handling batch");
    for message in &batch {
        debug!("{}", message);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    ConsumerConfig::set_defaults("batch-consumer", "events");
    let config = Config::init_from_env().context("invalid configuration")?;

    let service = BatchService::new();

    let recorder_handle = endpoints::setup_metrics_recorder()
        .context("failed to install the metrics recorder")?;
    let router = endpoints::metrics_router(recorder_handle)
        .merge(endpoints::readiness_router(service.shutdown_token()));
    let bind = config.bind();
    let shutdown = service.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = endpoints::serve(router, &bind, shutdown).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    });

    service.consume_kafka(
        &config.kafka,
        &config.consumer,
        config.batch_options(),
        handler_fn(log_batch),
    );

    let trigger = service.start().await?;
    service.log("batch-consumer-server", &format!("stopped after {:?}", trigger));
    service.cleanup()?;

    Ok(())
}
