use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConsumerError, SourceError};
use crate::funnel::ErrorReporter;
use crate::metrics_consts::{ITEMS_RECEIVED, SOURCE_ERRORS};

/// How long a single read may wait for the next item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadTimeout {
    /// Wait for the next item indefinitely.
    #[default]
    Blocking,
    /// Give up with [`SourceError::TimedOut`] after the given duration.
    After(Duration),
}

impl ReadTimeout {
    /// Zero or negative milliseconds mean "block forever".
    pub fn from_millis(ms: i64) -> Self {
        match u64::try_from(ms) {
            Ok(ms) if ms > 0 => ReadTimeout::After(Duration::from_millis(ms)),
            _ => ReadTimeout::Blocking,
        }
    }
}

/// A producer of items, one read at a time.
///
/// Implementations own the classification of their failures: anything they
/// can recover from is retried inside `next`, `TimedOut` means no item arrived
/// within the read timeout, and `Fatal` ends production.
#[async_trait]
pub trait ItemSource: Send + 'static {
    type Item: Send + 'static;

    async fn next(&mut self, timeout: ReadTimeout) -> Result<Self::Item, SourceError>;

    /// Release the underlying connection. Called once, after the last `next`
    /// and after the windower fed by this source has stopped.
    async fn close(&mut self) {}
}

/// Production loop: read items from `source` and forward them to the windower.
///
/// The loop ends on shutdown, on a fatal error, or when a finite read timeout
/// elapses without an item. In every case the payload sender is dropped
/// exactly once, which is what tells the windower to drain. The source stays
/// open: items of the final flush may still need it to acknowledge them.
pub(crate) async fn produce<S: ItemSource>(
    source: &mut S,
    read_timeout: ReadTimeout,
    payloads: mpsc::Sender<S::Item>,
    errors: ErrorReporter,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested, stopping item source");
                break;
            }
            next = source.next(read_timeout) => next,
        };

        match next {
            Ok(item) => {
                counter!(ITEMS_RECEIVED).increment(1);
                // Shutdown may arrive while the windower is busy in a handler call;
                // an item dropped here was never acknowledged.
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("shutdown requested while forwarding an item, stopping item source");
                        break;
                    }
                    sent = payloads.send(item) => {
                        if sent.is_err() {
                            warn!("windower is gone, stopping item source");
                            break;
                        }
                    }
                }
            }
            Err(SourceError::TimedOut) => match read_timeout {
                ReadTimeout::Blocking => {
                    debug!("read timed out without a deadline, reading again");
                    continue;
                }
                ReadTimeout::After(timeout) => {
                    info!(?timeout, "no item within the read timeout, stopping item source");
                    break;
                }
            },
            Err(err) => {
                counter!(SOURCE_ERRORS, "kind" => "fatal").increment(1);
                errors.report(ConsumerError::Source(err));
                break;
            }
        }
    }

    drop(payloads);
}
