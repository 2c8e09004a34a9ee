//! Shutdown coordination.
//!
//! One root [`CancellationToken`] is the only stop signal in the process.
//! The OS signal watcher and [`ShutdownCoordinator::stop`] both cancel it;
//! every pipeline holds a child token and closes its payload channel when
//! the token is cancelled. Cancelling an already cancelled token is a no-op.
//!
//! A stop request only counts once [`ShutdownCoordinator::wait`] has begun:
//! before that, `stop` does nothing and registered pipelines keep running.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ServiceError;

/// What initiated the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Interrupt,
    Terminate,
    StopRequested,
}

#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    waiting: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self {
            token: CancellationToken::new(),
            waiting: Arc::new(watch::channel(false).0),
        }
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a shutdown. Never blocks and is safe to call any number of
    /// times. Ignored until [`ShutdownCoordinator::wait`] has begun.
    pub fn stop(&self) {
        if !*self.waiting.borrow() {
            debug!("stop requested before the coordinator started waiting, ignoring");
            return;
        }
        self.token.cancel();
    }

    /// Whether [`ShutdownCoordinator::wait`] has begun.
    pub fn is_waiting(&self) -> bool {
        *self.waiting.borrow()
    }

    /// Resolves once [`ShutdownCoordinator::wait`] has begun, from which
    /// point [`ShutdownCoordinator::stop`] takes effect.
    pub async fn waiting(&self) {
        let mut waiting = self.waiting.subscribe();
        loop {
            if *waiting.borrow_and_update() {
                return;
            }
            // The sender is owned by self and outlives this loop
            if waiting.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The root token, cancelled once shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token for one pipeline, cancelled with the root.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Wait for SIGINT, SIGTERM or a stop request, then cancel the root token.
    pub async fn wait(&self) -> Result<ShutdownTrigger, ServiceError> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        self.waiting.send_replace(true);

        let trigger = tokio::select! {
            _ = terminate.recv() => ShutdownTrigger::Terminate,
            _ = interrupt.recv() => ShutdownTrigger::Interrupt,
            _ = self.token.cancelled() => ShutdownTrigger::StopRequested,
        };
        info!(?trigger, "shutting down gracefully");

        self.token.cancel();
        Ok(trigger)
    }
}
