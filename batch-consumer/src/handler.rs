use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};

use crate::batch::Batch;
use crate::error::ConsumerError;
use crate::funnel::ErrorReporter;
use crate::metrics_consts::{HANDLER_DURATION, HANDLER_ERRORS};

/// Application logic run on every flushed batch.
#[async_trait]
pub trait BatchHandler<T: Send + 'static>: Send + Sync {
    async fn handle(&self, batch: Batch<T>) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, H> BatchHandler<T> for Arc<H>
where
    T: Send + 'static,
    H: BatchHandler<T> + ?Sized,
{
    async fn handle(&self, batch: Batch<T>) -> anyhow::Result<()> {
        self.as_ref().handle(batch).await
    }
}

/// A [`BatchHandler`] backed by an async function, see [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async function or closure taking a batch as a [`BatchHandler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

#[async_trait]
impl<T, F, Fut> BatchHandler<T> for HandlerFn<F>
where
    T: Send + 'static,
    F: Fn(Batch<T>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, batch: Batch<T>) -> anyhow::Result<()> {
        (self.f)(batch).await
    }
}

/// Calls the handler with completed batches.
///
/// `invoke` takes `&mut self` and is awaited by the windower before it reads
/// the next item, so at most one invocation is ever in flight. The handler's
/// result does not change flow control: a failed batch is reported through
/// the error funnel and considered processed.
pub struct HandlerInvoker<T, H> {
    handler: H,
    errors: ErrorReporter,
    _item: PhantomData<fn(T)>,
}

impl<T, H> HandlerInvoker<T, H>
where
    T: Send + 'static,
    H: BatchHandler<T>,
{
    pub fn new(handler: H, errors: ErrorReporter) -> Self {
        Self {
            handler,
            errors,
            _item: PhantomData,
        }
    }

    pub async fn invoke(&mut self, batch: Batch<T>) {
        let size = batch.len();
        let start = Instant::now();

        let result = self.handler.handle(batch).await;

        histogram!(HANDLER_DURATION).record(start.elapsed().as_secs_f64());
        if let Err(err) = result {
            counter!(HANDLER_ERRORS).increment(1);
            self.errors.report(ConsumerError::Handler {
                size,
                reason: format!("{err:#}"),
            });
        }
    }
}
