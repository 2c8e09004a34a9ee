//! Test doubles for sources and handlers, shared by unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::batch::Batch;
use crate::error::SourceError;
use crate::handler::BatchHandler;
use crate::source::{ItemSource, ReadTimeout};

/// One scripted outcome of [`ScriptedSource::next`].
#[derive(Debug)]
pub enum Step<T> {
    Item(T),
    TimedOut,
    Fatal(String),
}

/// An item source driven by a channel of [`Step`]s.
///
/// Once the script is exhausted and its sender dropped, the source behaves
/// like an idle broker: it times out after a finite read timeout and blocks
/// forever otherwise.
pub struct ScriptedSource<T> {
    steps: mpsc::UnboundedReceiver<Step<T>>,
    closed: Arc<AtomicBool>,
}

pub fn scripted_source<T>() -> (mpsc::UnboundedSender<Step<T>>, ScriptedSource<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let source = ScriptedSource {
        steps: rx,
        closed: Arc::new(AtomicBool::new(false)),
    };
    (tx, source)
}

impl<T> ScriptedSource<T> {
    /// Flag set once the source was closed.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

#[async_trait]
impl<T: Send + 'static> ItemSource for ScriptedSource<T> {
    type Item = T;

    async fn next(&mut self, timeout: ReadTimeout) -> Result<T, SourceError> {
        match self.steps.recv().await {
            Some(Step::Item(item)) => Ok(item),
            Some(Step::TimedOut) => Err(SourceError::TimedOut),
            Some(Step::Fatal(reason)) => Err(SourceError::fatal(reason)),
            None => match timeout {
                ReadTimeout::After(timeout) => {
                    tokio::time::sleep(timeout).await;
                    Err(SourceError::TimedOut)
                }
                ReadTimeout::Blocking => std::future::pending().await,
            },
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A handler recording every batch it receives, and how many invocations
/// overlapped.
#[derive(Clone)]
pub struct RecordingHandler<T> {
    batches: Arc<Mutex<Vec<Vec<T>>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    delay: Option<Duration>,
    fail: bool,
}

impl<T> Default for RecordingHandler<T> {
    fn default() -> Self {
        Self {
            batches: Default::default(),
            active: Default::default(),
            max_active: Default::default(),
            delay: None,
            fail: false,
        }
    }
}

impl<T: Clone> RecordingHandler<T> {
    /// Record batches, then fail every invocation.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Take `delay` to handle every batch.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn batches(&self) -> Vec<Vec<T>> {
        self.batches.lock().expect("poisoned RecordingHandler mutex").clone()
    }

    pub fn invocations(&self) -> usize {
        self.batches.lock().expect("poisoned RecordingHandler mutex").len()
    }

    /// Highest number of invocations observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T> BatchHandler<T> for RecordingHandler<T>
where
    T: Clone + Send + 'static,
{
    async fn handle(&self, batch: Batch<T>) -> anyhow::Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.batches
            .lock()
            .expect("poisoned RecordingHandler mutex")
            .push(batch.into_items());

        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("handler failure"));
        }
        Ok(())
    }
}
