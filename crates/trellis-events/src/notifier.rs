use tokio::sync::mpsc;

use crate::ExecutionEvent;

/// Trait for receiving every execution event, across all executions.
///
/// The emitter calls `notify` after an event has been sequenced and queued
/// for persistence. Implementations must not block.
pub trait ExecutionNotifier: Send + Sync {
  /// Called when an execution event occurs.
  fn notify(&self, event: &ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: &ExecutionEvent) {}
}

/// A notifier that forwards events to an unbounded channel.
///
/// Unlike a [`Subscription`](crate::Subscription) this never lags, so it
/// suits consumers that must see everything, such as an audit sink.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  /// Create a new channel notifier.
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: &ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event.clone());
  }
}
