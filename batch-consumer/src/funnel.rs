//! Decoupled reporting of asynchronous failures.
//!
//! Producers hold a cloneable [`ErrorReporter`] and never block on it; a
//! dedicated task runs [`ErrorFunnel::run`] and logs every error tagged with
//! the pipeline's component name. The funnel closes once every reporter has
//! been dropped.

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::ConsumerError;

#[derive(Clone, Debug)]
pub struct ErrorReporter {
    sender: mpsc::UnboundedSender<ConsumerError>,
}

impl ErrorReporter {
    /// Queue an error for reporting, returns immediately.
    pub fn report(&self, error: ConsumerError) {
        if let Err(err) = self.sender.send(error) {
            warn!("error funnel closed, dropping error: {}", err.0)
        }
    }
}

pub struct ErrorFunnel {
    component: String,
    receiver: mpsc::UnboundedReceiver<ConsumerError>,
}

impl ErrorFunnel {
    pub fn new(component: &str) -> (ErrorReporter, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let funnel = Self {
            component: component.to_owned(),
            receiver,
        };
        (ErrorReporter { sender }, funnel)
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Receive the next reported error without logging it.
    pub async fn recv(&mut self) -> Option<ConsumerError> {
        self.receiver.recv().await
    }

    /// Log every reported error until all reporters are gone.
    /// Returns how many errors went through the funnel.
    pub async fn run(mut self) -> usize {
        let mut reported = 0;
        while let Some(err) = self.receiver.recv().await {
            reported += 1;
            error!(component = %self.component, "{}", err);
        }
        reported
    }
}
