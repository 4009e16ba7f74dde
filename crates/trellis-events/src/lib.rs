//! Execution events and notifiers for observability.
//!
//! Every node or execution transition and every node log line becomes an
//! [`ExecutionEvent`] with a per-execution sequence number. Events are
//! broadcast to live [`Subscription`]s and queued for persistence as
//! [`ExecutionLogEntry`](trellis_store::ExecutionLogEntry) records, which are
//! the replay source when a subscriber falls behind.

mod emitter;
mod event;
mod notifier;
mod subscription;

pub use emitter::Emitter;
pub use event::{EventKind, EventStatus, ExecutionEvent};
pub use notifier::{ChannelNotifier, ExecutionNotifier, NoopNotifier};
pub use subscription::{RecvError, Subscription};
