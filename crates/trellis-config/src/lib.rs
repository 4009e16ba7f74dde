//! Trellis Config
//!
//! This crate contains the serializable workflow definition types for trellis.
//! These types represent workflows as they are stored by the (external) CRUD
//! layer, before they are validated into an executable graph by
//! `trellis-workflow`.
//!
//! Definitions can be loaded from:
//! - JSON files (via the CLI, `trellis run workflow workflow.json`)
//! - Database storage (as JSON blobs)
//!
//! Node `config` values are arbitrary JSON and may embed `{{ ... }}`
//! expressions that are resolved right before the node runs.

mod connection;
mod enums;
mod node;
mod retry;
mod workflow;

pub use connection::{ConnectionDef, MAIN_HANDLE};
pub use enums::{BackoffKind, TriggerKind};
pub use node::NodeDef;
pub use retry::RetryPolicy;
pub use workflow::{WorkflowDef, WorkflowSettings};
