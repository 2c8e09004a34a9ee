use std::pin::Pin;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, info};

use crate::buffer::BatchBuffer;
use crate::config::BatchOptions;
use crate::funnel::ErrorReporter;
use crate::handler::{BatchHandler, HandlerInvoker};
use crate::lifecycle::LifecycleState;
use crate::metrics_consts::{BATCH_FLUSHES, BATCH_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Timeout,
    Drain,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timeout => "timeout",
            FlushTrigger::Drain => "drain",
        }
    }
}

/// Groups incoming items into windows and flushes them to the handler.
///
/// A window flushes when it holds `batch_size` items or when `batch_timeout`
/// elapses with at least one item buffered. An empty window is never
/// delivered: the timer just restarts. The handler is awaited inside the
/// loop, so no item is read while a batch is being handled. When the payload
/// channel closes, whatever is buffered goes out in one final flush.
///
/// An item and an expired timer ready at the same time are resolved in favour
/// of the item: it joins the open window, which may then flush on size.
pub struct BatchWindower<T, H> {
    batch_size: usize,
    batch_timeout: Option<Duration>,
    buffer: BatchBuffer<T>,
    invoker: HandlerInvoker<T, H>,
    state: watch::Sender<LifecycleState>,
}

impl<T, H> BatchWindower<T, H>
where
    T: Send + 'static,
    H: BatchHandler<T>,
{
    pub fn new(
        options: &BatchOptions,
        handler: H,
        errors: ErrorReporter,
        state: watch::Sender<LifecycleState>,
    ) -> Self {
        let batch_size = options.batch_size.get();
        Self {
            batch_size,
            batch_timeout: options.batch_timeout,
            buffer: BatchBuffer::with_capacity(batch_size),
            invoker: HandlerInvoker::new(handler, errors),
            state,
        }
    }

    /// Run until `payloads` is closed and the last window has been flushed.
    pub async fn run(mut self, mut payloads: mpsc::Receiver<T>) {
        self.state.send_replace(LifecycleState::Running);
        info!(
            batch_size = self.batch_size,
            batch_timeout = ?self.batch_timeout,
            "batch windower running"
        );

        // Never polled when the timeout trigger is disabled
        let timer = sleep(self.batch_timeout.unwrap_or_default());
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;

                next = payloads.recv() => match next {
                    Some(item) => {
                        self.buffer.add(item);
                        if self.buffer.len() >= self.batch_size {
                            self.flush(FlushTrigger::Size).await;
                            self.restart_timer(timer.as_mut());
                        }
                    }
                    None => break,
                },

                () = &mut timer, if self.batch_timeout.is_some() => {
                    if !self.buffer.is_empty() {
                        self.flush(FlushTrigger::Timeout).await;
                    }
                    self.restart_timer(timer.as_mut());
                }
            }
        }

        self.state.send_replace(LifecycleState::Draining);
        info!(buffered = self.buffer.len(), "payload channel closed, draining");
        if !self.buffer.is_empty() {
            self.flush(FlushTrigger::Drain).await;
        }

        self.state.send_replace(LifecycleState::Stopped);
        info!("batch windower stopped");
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        let batch = self.buffer.drain();

        counter!(BATCH_FLUSHES, "trigger" => trigger.as_str()).increment(1);
        histogram!(BATCH_SIZE).record(batch.len() as f64);
        debug!(trigger = trigger.as_str(), size = batch.len(), "flushing batch");

        self.invoker.invoke(batch).await;
    }

    fn restart_timer(&self, timer: Pin<&mut Sleep>) {
        if let Some(timeout) = self.batch_timeout {
            timer.reset(Instant::now() + timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::error::ConsumerError;
    use crate::funnel::ErrorFunnel;
    use crate::test_utils::RecordingHandler;

    struct Harness<T> {
        payloads: mpsc::Sender<T>,
        state: watch::Receiver<LifecycleState>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start<T, H>(options: BatchOptions, handler: H) -> (Harness<T>, ErrorFunnel)
    where
        T: Send + 'static,
        H: BatchHandler<T> + 'static,
    {
        let (reporter, funnel) = ErrorFunnel::new("test");
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let (tx, rx) = mpsc::channel(64);
        let windower = BatchWindower::new(&options, handler, reporter, state_tx);
        let harness = Harness {
            payloads: tx,
            state: state_rx,
            task: tokio::spawn(windower.run(rx)),
        };
        (harness, funnel)
    }

    fn options(batch_size: usize, batch_timeout_ms: u64) -> BatchOptions {
        BatchOptions::new(NonZeroUsize::new(batch_size).unwrap())
            .with_batch_timeout(Duration::from_millis(batch_timeout_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_splits_items_into_full_batches() {
        let handler = RecordingHandler::default();
        let (harness, _funnel) = start(options(3, 10_000), handler.clone());

        for i in 0..7 {
            harness.payloads.send(i).await.unwrap();
        }
        // Let the windower consume everything, well below the batch timeout
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handler.batches(), vec![vec![0, 1, 2], vec![3, 4, 5]]);

        drop(harness.payloads);
        harness.task.await.unwrap();

        // ceil(7 / 3) invocations, the last one partial
        assert_eq!(
            handler.batches(),
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn size_then_timeout_trigger() {
        let handler = RecordingHandler::default();
        let (harness, _funnel) = start(options(3, 100), handler.clone());

        for item in ["a", "b", "c"] {
            harness.payloads.send(item).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        for item in ["d", "e"] {
            harness.payloads.send(item).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handler.batches(), vec![vec!["a", "b", "c"], vec!["d", "e"]]);

        drop(harness.payloads);
        harness.task.await.unwrap();

        // Nothing left to drain
        assert_eq!(handler.invocations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_timeout_only_flushes_on_close() {
        let handler = RecordingHandler::default();
        let options = BatchOptions::new(NonZeroUsize::new(5).unwrap());
        let (harness, _funnel) = start(options, handler.clone());

        for item in ["a", "b", "c"] {
            harness.payloads.send(item).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(handler.invocations(), 0);

        drop(harness.payloads);
        harness.task.await.unwrap();

        assert_eq!(handler.batches(), vec![vec!["a", "b", "c"]]);
        assert_eq!(*harness.state.borrow(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_windows_are_never_delivered() {
        let handler = RecordingHandler::<u32>::default();
        let (harness, _funnel) = start(options(2, 10), handler.clone());

        // Hundreds of timer fires on an empty buffer
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handler.invocations(), 0);

        harness.payloads.send(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(handler.batches(), vec![vec![1]]);

        drop(harness.payloads);
        harness.task.await.unwrap();
        assert_eq!(handler.batches(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_moves_from_idle_to_stopped() {
        let handler = RecordingHandler::default();
        let (harness, _funnel) = start(options(2, 50), handler.clone());
        assert!(*harness.state.borrow() <= LifecycleState::Running);

        harness.payloads.send(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*harness.state.borrow(), LifecycleState::Running);

        drop(harness.payloads);
        harness.task.await.unwrap();
        assert_eq!(*harness.state.borrow(), LifecycleState::Stopped);
        assert_eq!(handler.batches(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_invocations_never_overlap() {
        let handler = RecordingHandler::slow(Duration::from_millis(50));
        let (harness, _funnel) = start(options(1, 10), handler.clone());

        for i in 0..5 {
            harness.payloads.send(i).await.unwrap();
        }
        drop(harness.payloads);
        harness.task.await.unwrap();

        assert_eq!(
            handler.batches(),
            vec![vec![0], vec![1], vec![2], vec![3], vec![4]]
        );
        assert_eq!(handler.max_concurrent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_errors_go_to_the_funnel_and_consumption_continues() {
        let handler = RecordingHandler::failing();
        let (harness, mut funnel) = start(options(2, 1_000), handler.clone());

        for i in 0..4 {
            harness.payloads.send(i).await.unwrap();
        }
        drop(harness.payloads);
        harness.task.await.unwrap();

        assert_eq!(handler.batches(), vec![vec![0, 1], vec![2, 3]]);
        for _ in 0..2 {
            match funnel.recv().await {
                Some(ConsumerError::Handler { size, .. }) => assert_eq!(size, 2),
                other => panic!("unexpected funnel content: {:?}", other),
            }
        }
        // The windower dropped its reporter when it stopped
        assert!(funnel.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn order_is_preserved_across_batches() {
        let handler = RecordingHandler::default();
        let (harness, _funnel) = start(options(4, 20), handler.clone());

        for i in 0..10 {
            harness.payloads.send(i).await.unwrap();
            if i % 3 == 0 {
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
        }
        drop(harness.payloads);
        harness.task.await.unwrap();

        let batches = handler.batches();
        assert!(batches.iter().all(|batch| !batch.is_empty() && batch.len() <= 4));
        let delivered: Vec<i32> = batches.into_iter().flatten().collect();
        assert_eq!(delivered, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_item_wins_over_an_expired_timer() {
        let handler = RecordingHandler::default();
        let (harness, _funnel) = start(options(2, 100), handler.clone());

        harness.payloads.send("a").await.unwrap();
        // The windower buffers "a" and arms its timer for t=100ms
        tokio::time::sleep(Duration::from_millis(50)).await;

        harness.payloads.try_send("b").unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(handler.batches(), vec![vec!["a", "b"]]);

        drop(harness.payloads);
        harness.task.await.unwrap();
        assert_eq!(handler.invocations(), 1);
    }
}
