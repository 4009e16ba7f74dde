//! Trellis Engine
//!
//! Runs validated workflows as stateful, resumable executions.
//!
//! - [`Engine`]: starts executions and exposes status, logs, node states,
//!   live events and cancel/pause/resume by execution id
//! - a per-execution scheduler: readiness over the DAG, concurrent dispatch,
//!   retry with backoff, skip propagation and halting on failure
//! - [`TriggerRunner`]: turns trigger firings into executions
//! - [`WorkflowSource`]: where workflow versions are loaded from

mod config;
mod engine;
mod error;
mod scheduler;
mod source;
mod trigger;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;
pub use source::{InMemoryWorkflows, WorkflowSource};
pub use trigger::{TriggerFiring, TriggerRunner};
