//! Trellis Node Invoker
//!
//! Locates a node's implementation by type, runs it with a resolved input
//! under a deadline, and turns every way it can go wrong into a typed
//! [`NodeError`](trellis_store::NodeError).
//!
//! - [`NodeImplementation`]: the plugin trait nodes implement
//! - [`NodeRegistry`] / [`StaticRegistry`]: type string to implementation
//! - [`CredentialResolver`] / [`StaticCredentials`]: lazy credential access
//! - [`NodeInvoker`]: deadline, execution mode and error mapping

mod context;
mod credentials;
mod invoker;
mod registry;

pub use context::{NodeContext, NodeLogger};
pub use credentials::{Credential, CredentialError, CredentialResolver, StaticCredentials};
pub use invoker::{Invocation, NodeInvoker};
pub use registry::{ExecutionMode, NodeImplementation, NodeRegistry, StaticRegistry};
