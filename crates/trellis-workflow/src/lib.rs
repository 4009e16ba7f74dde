//! Trellis Workflow
//!
//! This crate provides the validated workflow representation for trellis.
//! A [`Workflow`] is built from a `trellis-config` [`WorkflowDef`] and is
//! ready for execution.
//!
//! Key differences from `trellis-config`:
//! - Graph structure is validated (known endpoints, no duplicates, acyclic)
//! - Node policies are resolved against the workflow settings (retry, timeout)
//! - Entry points, join points and a topological order are precomputed
//!
//! [`WorkflowDef`]: trellis_config::WorkflowDef

mod error;
mod graph;
mod node;
mod workflow;

pub use error::WorkflowError;
pub use graph::Graph;
pub use node::Node;
pub use workflow::Workflow;
