use std::future::Future;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, Instrument};

use crate::config::BatchOptions;
use crate::error::{BoxError, ConsumerError};
use crate::funnel::ErrorFunnel;
use crate::handler::BatchHandler;
use crate::lifecycle::{LifecycleState, PipelineHandle};
use crate::source::{produce, ItemSource};
use crate::windower::BatchWindower;

/// Spawn the tasks of one consumption pipeline on `tracker`.
///
/// Three tasks run per pipeline: the source (connects, then reads and
/// forwards items), the windower, and the error funnel. If connecting fails
/// the error is reported and the source task ends without producing
/// anything, so the windower stops right away with nothing to flush.
///
/// Once production ends the source task keeps the source open until the
/// windower reached `Stopped`: the final flush still acknowledges its items
/// through it (Kafka offsets are stored on the consumer).
pub(crate) fn spawn<S, C, E, H>(
    tracker: &TaskTracker,
    tag: &str,
    connect: C,
    options: BatchOptions,
    handler: H,
    shutdown: CancellationToken,
) -> PipelineHandle
where
    S: ItemSource,
    C: Future<Output = Result<S, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
    H: BatchHandler<S::Item> + 'static,
{
    let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
    let (payload_tx, payload_rx) = mpsc::channel(options.payload_buffer);
    let (errors, funnel) = ErrorFunnel::new(tag);
    let windower = BatchWindower::new(&options, handler, errors.clone(), state_tx);
    let span = tracing::info_span!("pipeline", component = %tag);

    tracker.spawn(funnel.run().instrument(span.clone()));

    let read_timeout = options.read_timeout;
    let windower_state = PipelineHandle::new(tag, state_rx.clone());
    tracker.spawn(
        async move {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested before the item source connected");
                    return;
                }
                connected = connect => connected,
            };
            match connected {
                Ok(mut source) => {
                    produce(&mut source, read_timeout, payload_tx, errors, shutdown).await;
                    windower_state.stopped().await;
                    source.close().await;
                }
                Err(err) => errors.report(ConsumerError::Connect(err.into())),
            }
        }
        .instrument(span.clone()),
    );

    tracker.spawn(windower.run(payload_rx).instrument(span));

    PipelineHandle::new(tag, state_rx)
}
