use tokio::sync::watch;

/// Lifecycle of a single consumption pipeline.
///
/// Transitions only move forward: `Idle -> Running -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Created, the windower has not started yet
    Idle,
    /// Accumulating and flushing windows
    Running,
    /// The payload channel closed, the final flush is in progress
    Draining,
    /// Final flush done, every pipeline resource released
    Stopped,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped)
    }
}

/// Observes the lifecycle of a spawned pipeline.
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    tag: String,
    state: watch::Receiver<LifecycleState>,
}

impl PipelineHandle {
    pub(crate) fn new(tag: &str, state: watch::Receiver<LifecycleState>) -> Self {
        Self {
            tag: tag.to_owned(),
            state,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Wait until the pipeline reached `Stopped`.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        loop {
            if state.borrow_and_update().is_terminal() {
                return;
            }
            // The sender lives in the windower task; if it is gone the pipeline is over
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}
