//! Fill notifications
//!
//! Notifications are sent only after a fill is durably committed. A failed
//! notification is logged by the caller and never retried.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::order::FillEvent;

/// Notification failure
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Downstream consumer rejected or could not receive the event
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Receives committed fills
#[async_trait]
pub trait FillNotifier: Send + Sync + fmt::Debug {
    /// Deliver one fill event
    async fn notify(&self, event: &FillEvent) -> Result<(), NotifyError>;
}

/// Publishes fills on a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    /// Event bus
    event_bus: broadcast::Sender<FillEvent>,
}

impl BroadcastNotifier {
    /// Create a notifier with room for `capacity` undelivered events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (event_bus, _) = broadcast::channel(capacity.max(1));
        Self { event_bus }
    }

    /// Subscribe to fill events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FillEvent> {
        self.event_bus.subscribe()
    }
}

#[async_trait]
impl FillNotifier for BroadcastNotifier {
    async fn notify(&self, event: &FillEvent) -> Result<(), NotifyError> {
        // No subscribers is not a failure
        let _ = self.event_bus.send(event.clone());
        Ok(())
    }
}
