//! Notification sinks for lifecycle events.
//!
//! `Notifier::notify` is fire-and-forget: implementations must not block the
//! caller and swallow their own delivery failures.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::events::LifecycleEvent;

/// Receives terminal and start events for user-facing reporting.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &LifecycleEvent);
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::FailedToStart { .. } | LifecycleEvent::Failed { .. } => {
                warn!(command = %event.name(), title = event.title(), "{}", event.body());
            }
            _ => info!(command = %event.name(), title = event.title(), "{}", event.body()),
        }
    }
}

/// Forwards events to an unbounded channel so a control surface can render
/// them. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: &LifecycleEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Delivers each event to every inner notifier in order.
#[derive(Default, Clone)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}
