//! Kafka implementation of [`ItemSource`].
//!
//! Offsets are stored manually (`enable.auto.offset.store=false`) and only
//! after the application handler returned for the batch holding them; the
//! background auto-commit then commits what has been stored. A crash between
//! reading and handling redelivers the batch: delivery is at-least-once.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::BorrowedMessage,
    ClientConfig, Message,
};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::SourceError;
use crate::handler::BatchHandler;
use crate::metrics_consts::{OFFSET_STORE_ERRORS, SOURCE_ERRORS};
use crate::source::{ItemSource, ReadTimeout};

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

/// Position of a consumed message, to be stored once its batch was handled.
#[derive(Debug)]
pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }
}

/// A message payload read from Kafka, along with its offset.
#[derive(Debug)]
pub struct KafkaItem {
    payload: String,
    offset: Offset,
}

impl KafkaItem {
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_parts(self) -> (String, Offset) {
        (self.payload, self.offset)
    }
}

/// Build the rdkafka client configuration for a batch consumer.
pub fn client_config(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &kafka.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &consumer.kafka_consumer_group)
        .set("auto.offset.reset", &consumer.kafka_consumer_offset_reset)
        .set("enable.auto.commit", "true")
        .set(
            "auto.commit.interval.ms",
            consumer.kafka_consumer_auto_commit_interval_ms.to_string(),
        )
        .set("enable.auto.offset.store", "false")
        .set("socket.keepalive.enable", "true");

    if kafka.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    } else {
        client_config.set("security.protocol", "plaintext");
    };

    client_config
}

pub struct KafkaItemSource {
    inner: Arc<Inner>,
    consecutive_errors: u64,
}

impl KafkaItemSource {
    pub fn new(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Result<Self, KafkaError> {
        let client_config = client_config(kafka, consumer);
        debug!("rdkafka configuration: {:?}", client_config);

        let stream_consumer: StreamConsumer = client_config.create()?;
        stream_consumer.subscribe(&[consumer.kafka_consumer_topic.as_str()])?;
        info!(
            topic = %consumer.kafka_consumer_topic,
            group = %consumer.kafka_consumer_group,
            "subscribed to Kafka topic"
        );

        let inner = Inner {
            consumer: stream_consumer,
            topic: consumer.kafka_consumer_topic.clone(),
        };
        Ok(Self {
            inner: Arc::new(inner),
            consecutive_errors: 0,
        })
    }
}

fn to_item(inner: &Arc<Inner>, message: &BorrowedMessage<'_>) -> KafkaItem {
    let payload = message
        .payload()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default();
    debug!(
        partition = message.partition(),
        offset = message.offset(),
        "received message from Kafka: {}",
        payload
    );

    KafkaItem {
        payload,
        offset: Offset {
            handle: Arc::downgrade(inner),
            partition: message.partition(),
            offset: message.offset(),
        },
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ErrorClass {
    Transient(&'static str),
    Fatal,
}

fn classify(error: &KafkaError) -> ErrorClass {
    match error {
        KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => {
            ErrorClass::Transient("partition_eof")
        }
        KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut) => {
            ErrorClass::Transient("op_timed_out")
        }
        KafkaError::MessageConsumption(_) => ErrorClass::Transient("consumer"),
        KafkaError::MessageConsumptionFatal(_) => ErrorClass::Fatal,
        KafkaError::Global(RDKafkaErrorCode::Authentication) => ErrorClass::Fatal,
        KafkaError::Global(RDKafkaErrorCode::AllBrokersDown) => {
            ErrorClass::Transient("all_brokers_down")
        }
        KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure) => {
            ErrorClass::Transient("broker_transport")
        }
        KafkaError::Global(_) => ErrorClass::Transient("global"),
        KafkaError::Canceled => ErrorClass::Fatal,
        _ => ErrorClass::Transient("unexpected"),
    }
}

fn backoff(consecutive_errors: u64) -> Duration {
    Duration::from_millis(100 * consecutive_errors.min(10))
}

impl KafkaItemSource {
    /// Receive the next message, retrying transient errors with backoff.
    async fn recv_item(&mut self) -> Result<KafkaItem, SourceError> {
        loop {
            match self.inner.consumer.recv().await {
                Ok(message) => {
                    let item = to_item(&self.inner, &message);
                    self.consecutive_errors = 0;
                    return Ok(item);
                }
                Err(err) => match classify(&err) {
                    ErrorClass::Transient(kind) => {
                        self.consecutive_errors += 1;
                        counter!(SOURCE_ERRORS, "kind" => kind).increment(1);
                        warn!("transient Kafka consumer error ({}): {}", kind, err);
                        sleep(backoff(self.consecutive_errors)).await;
                    }
                    ErrorClass::Fatal => return Err(SourceError::fatal(err)),
                },
            }
        }
    }
}

#[async_trait]
impl ItemSource for KafkaItemSource {
    type Item = KafkaItem;

    /// The read timeout bounds the whole read, transient retries included.
    async fn next(&mut self, timeout: ReadTimeout) -> Result<KafkaItem, SourceError> {
        match timeout {
            ReadTimeout::Blocking => self.recv_item().await,
            ReadTimeout::After(timeout) => tokio::time::timeout(timeout, self.recv_item())
                .await
                .unwrap_or(Err(SourceError::TimedOut)),
        }
    }

    async fn close(&mut self) {
        self.inner.consumer.unsubscribe();
        info!(topic = %self.inner.topic, "unsubscribed from Kafka topic");
    }
}

/// Hands the payloads of a Kafka batch to `H`, then stores the batch offsets.
///
/// Offsets are stored whatever the handler returned: a failed batch counts as
/// processed and is reported, not retried.
pub struct OffsetStoringHandler<H> {
    inner: H,
}

impl<H> OffsetStoringHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H> BatchHandler<KafkaItem> for OffsetStoringHandler<H>
where
    H: BatchHandler<String>,
{
    async fn handle(&self, batch: Batch<KafkaItem>) -> anyhow::Result<()> {
        let (payloads, offsets): (Vec<String>, Vec<Offset>) =
            batch.into_iter().map(KafkaItem::into_parts).unzip();

        let result = self.inner.handle(Batch::new(payloads)).await;

        for offset in offsets {
            let (partition, position) = (offset.partition(), offset.offset());
            if let Err(err) = offset.store() {
                counter!(OFFSET_STORE_ERRORS).increment(1);
                warn!(partition, offset = position, "failed to store offset: {}", err);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::funnel::ErrorFunnel;
    use crate::source::produce;
    use crate::test_utils::RecordingHandler;

    // Nothing listens on port 1: the consumer is created and subscribed, but
    // every connection attempt fails.
    fn unreachable_source() -> KafkaItemSource {
        KafkaItemSource::new(
            &KafkaConfig::new("127.0.0.1:1"),
            &ConsumerConfig::new("batch-consumer-test", "events"),
        )
        .unwrap()
    }

    fn offset_of(source: &KafkaItemSource, offset: i64) -> Offset {
        Offset {
            handle: Arc::downgrade(&source.inner),
            partition: 0,
            offset,
        }
    }

    fn detached_item(payload: &str, offset: i64) -> KafkaItem {
        KafkaItem {
            payload: payload.to_owned(),
            offset: Offset {
                handle: Weak::new(),
                partition: 0,
                offset,
            },
        }
    }

    #[test]
    fn client_config_matches_consumer_settings() {
        let kafka = KafkaConfig::new("broker-1:9092,broker-2:9092");
        let consumer = ConsumerConfig::new("billing", "events");
        let config = client_config(&kafka, &consumer);

        assert_eq!(
            config.get("bootstrap.servers"),
            Some("broker-1:9092,broker-2:9092")
        );
        assert_eq!(config.get("group.id"), Some("billing"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("security.protocol"), Some("plaintext"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("auto.commit.interval.ms"), Some("200"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("socket.keepalive.enable"), Some("true"));
    }

    #[test]
    fn client_config_with_tls() {
        let mut kafka = KafkaConfig::new("localhost:9093");
        kafka.kafka_tls = true;
        let config = client_config(&kafka, &ConsumerConfig::new("g", "t"));

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(
            config.get("enable.ssl.certificate.verification"),
            Some("false")
        );
    }

    #[test]
    fn classify_kafka_errors() {
        assert_eq!(
            classify(&KafkaError::MessageConsumption(
                RDKafkaErrorCode::PartitionEOF
            )),
            ErrorClass::Transient("partition_eof")
        );
        assert_eq!(
            classify(&KafkaError::Global(RDKafkaErrorCode::AllBrokersDown)),
            ErrorClass::Transient("all_brokers_down")
        );
        assert_eq!(
            classify(&KafkaError::MessageConsumptionFatal(
                RDKafkaErrorCode::Fail
            )),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify(&KafkaError::Global(RDKafkaErrorCode::Authentication)),
            ErrorClass::Fatal
        );
        assert_eq!(classify(&KafkaError::Canceled), ErrorClass::Fatal);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(10), Duration::from_secs(1));
        assert_eq!(backoff(500), Duration::from_secs(1));
    }

    #[test]
    fn storing_an_offset_after_the_consumer_is_gone_fails() {
        let (_, offset) = detached_item("x", 42).into_parts();
        assert_eq!(offset.offset(), 42);
        assert!(matches!(offset.store(), Err(OffsetErr::Gone)));
    }

    #[tokio::test]
    async fn offset_storing_handler_forwards_payloads_in_order() {
        let recorder = RecordingHandler::default();
        let handler = OffsetStoringHandler::new(recorder.clone());

        let batch = Batch::new(vec![
            detached_item("a", 1),
            detached_item("b", 2),
            detached_item("", 3),
        ]);
        handler.handle(batch).await.unwrap();

        assert_eq!(
            recorder.batches(),
            vec![vec!["a".to_owned(), "b".to_owned(), String::new()]]
        );
    }

    #[tokio::test]
    async fn offset_storing_handler_returns_the_handler_error() {
        let recorder = RecordingHandler::<String>::failing();
        let handler = OffsetStoringHandler::new(recorder.clone());

        let result = handler.handle(Batch::new(vec![detached_item("a", 1)])).await;

        assert!(result.is_err());
        assert_eq!(recorder.invocations(), 1);
    }

    #[tokio::test]
    async fn offsets_stay_storable_after_production_ends() {
        let mut source = unreachable_source();
        let pending = offset_of(&source, 10);
        let late = offset_of(&source, 11);

        let (tx, _rx) = mpsc::channel(1);
        let (reporter, _funnel) = ErrorFunnel::new("test");
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        produce(&mut source, ReadTimeout::Blocking, tx, reporter, shutdown).await;

        // The final flush runs after production ended: the consumer must still be there
        assert!(!matches!(pending.store(), Err(OffsetErr::Gone)));

        source.close().await;
        drop(source);
        assert!(matches!(late.store(), Err(OffsetErr::Gone)));
    }

    #[tokio::test]
    async fn read_timeout_bounds_the_whole_read() {
        let mut source = unreachable_source();
        let started = std::time::Instant::now();

        let result = source
            .next(ReadTimeout::After(Duration::from_millis(300)))
            .await;

        assert!(matches!(result, Err(SourceError::TimedOut)));
        // Transient broker errors and their backoff count against the deadline
        assert!(started.elapsed() < Duration::from_secs(2));
        source.close().await;
    }
}
