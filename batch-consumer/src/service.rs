use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::{BatchOptions, ConsumerConfig, KafkaConfig};
use crate::error::{BoxError, ServiceError};
use crate::handler::BatchHandler;
use crate::kafka::{KafkaItemSource, OffsetStoringHandler};
use crate::lifecycle::PipelineHandle;
use crate::pipeline;
use crate::shutdown::{ShutdownCoordinator, ShutdownTrigger};
use crate::source::{ItemSource, ReadTimeout};

/// Runs batch consumption pipelines and owns the process lifecycle.
///
/// Pipelines are registered with the `consume_*` methods and start right
/// away. [`BatchService::start`] blocks until SIGINT, SIGTERM or
/// [`BatchService::stop`], then waits for every pipeline to drain. A `stop`
/// issued before `start` has no effect.
#[derive(Default)]
pub struct BatchService {
    shutdown: ShutdownCoordinator,
    tracker: TaskTracker,
}

impl BatchService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown begins, for tasks living next to the service.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Consume `topic` from the Kafka brokers in `servers` as part of `group_id`,
    /// handing payloads to `handler` in batches.
    ///
    /// Returns immediately. A failure to create the consumer is logged through
    /// the pipeline's error funnel and is not returned: the pipeline then stops
    /// on its own while the service keeps running.
    #[allow(clippy::too_many_arguments)]
    pub fn consume_batch<H>(
        &self,
        servers: &str,
        topic: &str,
        group_id: &str,
        read_timeout: ReadTimeout,
        batch_size: NonZeroUsize,
        batch_timeout: Duration,
        handler: H,
    ) -> PipelineHandle
    where
        H: BatchHandler<String> + 'static,
    {
        let options = BatchOptions::new(batch_size)
            .with_batch_timeout(batch_timeout)
            .with_read_timeout(read_timeout);
        self.consume_kafka(
            &KafkaConfig::new(servers),
            &ConsumerConfig::new(group_id, topic),
            options,
            handler,
        )
    }

    /// Same as [`BatchService::consume_batch`], from full Kafka configurations.
    pub fn consume_kafka<H>(
        &self,
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
        options: BatchOptions,
        handler: H,
    ) -> PipelineHandle
    where
        H: BatchHandler<String> + 'static,
    {
        let tag = format!("batch-consumer/{}", consumer.kafka_consumer_topic);
        let kafka = kafka.clone();
        let consumer = consumer.clone();
        let connect = async move { KafkaItemSource::new(&kafka, &consumer) };

        self.consume_batch_from(&tag, connect, options, OffsetStoringHandler::new(handler))
    }

    /// Consume from any item source. `connect` runs inside the pipeline's
    /// source task.
    pub fn consume_batch_from<S, C, E, H>(
        &self,
        tag: &str,
        connect: C,
        options: BatchOptions,
        handler: H,
    ) -> PipelineHandle
    where
        S: ItemSource,
        C: Future<Output = Result<S, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        H: BatchHandler<S::Item> + 'static,
    {
        info!(
            component = tag,
            batch_size = options.batch_size.get(),
            batch_timeout = ?options.batch_timeout,
            read_timeout = ?options.read_timeout,
            "starting batch consumer"
        );
        pipeline::spawn(
            &self.tracker,
            tag,
            connect,
            options,
            handler,
            self.shutdown.child_token(),
        )
    }

    /// Block until a termination signal or [`BatchService::stop`], then wait
    /// for every pipeline to reach `Stopped`.
    pub async fn start(&self) -> Result<ShutdownTrigger, ServiceError> {
        let trigger = self.shutdown.wait().await?;

        self.tracker.close();
        self.tracker.wait().await;
        info!("all batch consumers stopped");

        Ok(trigger)
    }

    /// Request a shutdown. Non-blocking and idempotent; a no-op until `start`
    /// is running.
    pub fn stop(&self) {
        self.shutdown.stop();
    }

    /// Resolves once `start` is waiting for a shutdown trigger.
    pub async fn started(&self) {
        self.shutdown.waiting().await;
    }

    /// Release resources after shutdown.
    pub fn cleanup(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    pub fn log(&self, tag: &str, message: &str) {
        info!(component = tag, "{}", message);
    }
}
