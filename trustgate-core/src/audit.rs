//! Behavior-event sinks.
//!
//! Every penalty the behavior tracker applies emits a [`BehaviorEvent`] to a
//! configured listener. The default sinks cover the two common deployments:
//! JSON lines on stdout for containerized gateways whose logs are scraped
//! externally, and a no-op for tests.

use crate::behavior::BehaviorEvent;

/// Trait for behavior-event listeners.
pub trait BehaviorListener: Send + Sync + std::fmt::Debug {
    /// Receive one event. Implementations must not block the caller.
    fn on_event(&self, event: &BehaviorEvent);
}

/// A listener that writes events to stdout as JSON lines.
#[derive(Debug, Default)]
pub struct StdoutListener;

impl StdoutListener {
    pub fn new() -> Self {
        Self
    }
}

impl BehaviorListener for StdoutListener {
    fn on_event(&self, event: &BehaviorEvent) {
        match serde_json::to_string(event) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::warn!("failed to serialize behavior event: {e}"),
        }
    }
}

/// A listener that discards events.
#[derive(Debug, Default)]
pub struct NoOpListener;

impl BehaviorListener for NoOpListener {
    fn on_event(&self, _event: &BehaviorEvent) {}
}
