//! Expression resolution for node configuration.
//!
//! Node configs are arbitrary JSON in which any string may embed minijinja
//! expressions. Before a node runs, [`ExpressionResolver::resolve`] walks the
//! config and evaluates every expression against a [`Scope`].
//!
//! # Scope
//! ```json
//! {
//!   "nodes": { "fetch_user": { "email": "a@b.c", "tags": ["x"] } },
//!   "vars": { "region": "eu" },
//!   "execution": { "id": "..." },
//!   "workflow": { "id": "...", "version": 3 },
//!   "now": "2024-01-01T00:00:00Z",
//!   "trigger": { ... },
//!   "input": { ... }
//! }
//! ```
//!
//! # Substitution
//! - `"{{ nodes.fetch_user.tags }}"` (a single expression) keeps the JSON type
//!   of the result, here an array.
//! - `"Hello {{ nodes.fetch_user.email }}"` renders to a string.
//! - Strings without `{{` are left untouched.
//!
//! Undefined values are errors, never empty strings: referencing a node that
//! has not succeeded, or a missing field, yields
//! [`ExpressionError::UnresolvedReference`].

mod error;
mod resolver;
mod scope;

pub use error::ExpressionError;
pub use resolver::ExpressionResolver;
pub use scope::{ExecutionMeta, Scope, WorkflowMeta};
