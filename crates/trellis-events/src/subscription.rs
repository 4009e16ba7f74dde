use tokio::sync::broadcast;
use tracing::warn;

use crate::ExecutionEvent;

/// Why a [`Subscription`] could not yield the next event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
  /// The subscriber fell behind and `missed` events were dropped from its
  /// live feed. Replay them from the execution logs after `last_sequence`.
  #[error("subscriber lagged: {missed} events missed after sequence {last_sequence}")]
  Lagged { missed: u64, last_sequence: u64 },

  /// The execution finished and every buffered event has been delivered.
  #[error("event stream closed")]
  Closed,
}

/// A live feed of one execution's events.
pub struct Subscription {
  execution_id: String,
  receiver: broadcast::Receiver<ExecutionEvent>,
  last_sequence: u64,
}

impl Subscription {
  pub(crate) fn new(execution_id: String, receiver: broadcast::Receiver<ExecutionEvent>) -> Self {
    Self {
      execution_id,
      receiver,
      last_sequence: 0,
    }
  }

  pub fn execution_id(&self) -> &str {
    &self.execution_id
  }

  /// Sequence number of the last event delivered, 0 before the first.
  pub fn last_sequence(&self) -> u64 {
    self.last_sequence
  }

  /// Wait for the next event.
  ///
  /// After [`RecvError::Lagged`] the subscription stays usable and continues
  /// with the oldest event still buffered.
  pub async fn recv(&mut self) -> Result<ExecutionEvent, RecvError> {
    match self.receiver.recv().await {
      Ok(event) => {
        self.last_sequence = event.sequence;
        Ok(event)
      }
      Err(broadcast::error::RecvError::Lagged(missed)) => {
        warn!(
          execution_id = %self.execution_id,
          missed,
          last_sequence = self.last_sequence,
          "subscriber_lagged"
        );
        Err(RecvError::Lagged {
          missed,
          last_sequence: self.last_sequence,
        })
      }
      Err(broadcast::error::RecvError::Closed) => Err(RecvError::Closed),
    }
  }

  /// Drain events until the stream closes, skipping over lag gaps.
  pub async fn collect(mut self) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    loop {
      match self.recv().await {
        Ok(event) => events.push(event),
        Err(RecvError::Lagged { .. }) => continue,
        Err(RecvError::Closed) => return events,
      }
    }
  }
}
