use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time;

use batch_consumer::config::{BatchOptions, ConsumerConfig, KafkaConfig};
use batch_consumer::source::ReadTimeout;
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "100")]
    pub batch_size: NonZeroUsize,

    // Zero or negative disables the timeout trigger
    #[envconfig(default = "1000")]
    pub batch_timeout_ms: EnvMsDuration,

    // Zero or negative blocks until the next message
    #[envconfig(default = "-1")]
    pub read_timeout_ms: EnvMsDuration,

    #[envconfig(default = "1")]
    pub payload_buffer: usize,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions::new(self.batch_size)
            .with_batch_timeout(self.batch_timeout_ms.positive().unwrap_or_default())
            .with_read_timeout(ReadTimeout::from_millis(self.read_timeout_ms.0))
            .with_payload_buffer(self.payload_buffer)
    }
}

/// Signed millisecond duration, where zero and negative values act as sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub i64);

impl EnvMsDuration {
    pub fn positive(&self) -> Option<time::Duration> {
        u64::try_from(self.0)
            .ok()
            .filter(|ms| *ms > 0)
            .map(time::Duration::from_millis)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(ms))
    }
}
