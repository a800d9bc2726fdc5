#![warn(missing_docs)]

//! Switchboard server core: turns a completion-queue transport into a
//! synchronous-looking handler model.
//!
//! Worker threads drain per-thread completion queues and drive per-call
//! state machines; handlers are plain functions re-entered by the
//! framework as call events arrive, and never block on transport I/O.

pub mod context;
mod dispatcher;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod server;
mod slot;

pub use context::{
    BindingParam, ClientStreamContext, RpcContext, ServerStreamContext, StreamStatus, UserSlot,
};
pub use error::{Result, ServerError};
pub use metrics::{RegistryMetrics, RegistryMetricsSnapshot};
pub use registry::{Service, ServiceBinder, ServiceHandle, ServiceRegistry};
pub use server::{ServerBuilder, ServerConfig, ServerCore, ServerHandle, ServerHandler};
