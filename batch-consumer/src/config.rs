use std::num::NonZeroUsize;
use std::time::Duration;

use envconfig::Envconfig;

use crate::source::ReadTimeout;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

impl KafkaConfig {
    pub fn new(kafka_hosts: &str) -> Self {
        Self {
            kafka_hosts: kafka_hosts.to_owned(),
            kafka_tls: false,
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Offsets are only stored once a batch has been handled, the auto-commit
    // then periodically commits whatever has been stored.
    #[envconfig(default = "200")]
    pub kafka_consumer_auto_commit_interval_ms: u32,
}

impl ConsumerConfig {
    pub fn new(group_id: &str, topic: &str) -> Self {
        Self {
            kafka_consumer_group: group_id.to_owned(),
            kafka_consumer_topic: topic.to_owned(),
            kafka_consumer_offset_reset: "earliest".to_owned(),
            kafka_consumer_auto_commit_interval_ms: 200,
        }
    }

    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };
    }
}

/// Windowing and intake settings for one pipeline.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Flush as soon as this many items are buffered.
    pub batch_size: NonZeroUsize,
    /// Flush a non-empty window after this long, `None` disables the timeout trigger.
    pub batch_timeout: Option<Duration>,
    /// Passed to the item source on every read.
    pub read_timeout: ReadTimeout,
    /// Capacity of the channel between the source and the windower.
    pub payload_buffer: usize,
}

impl BatchOptions {
    pub fn new(batch_size: NonZeroUsize) -> Self {
        Self {
            batch_size,
            batch_timeout: None,
            read_timeout: ReadTimeout::Blocking,
            payload_buffer: 1,
        }
    }

    /// A zero timeout disables the timeout trigger.
    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = (!batch_timeout.is_zero()).then_some(batch_timeout);
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: ReadTimeout) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_payload_buffer(mut self, payload_buffer: usize) -> Self {
        // tokio channels need room for at least one item
        self.payload_buffer = payload_buffer.max(1);
        self
    }
}
