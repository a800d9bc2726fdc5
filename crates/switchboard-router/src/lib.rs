#![warn(missing_docs)]

//! Switchboard router: serves calls upstream while acting as a client to
//! a downstream target, bridging streams synchronously or through a
//! bounded pipe fed by a reader thread.

pub mod hooks;
pub mod pipe;
pub mod reader;
pub mod router;

pub use hooks::{CallParam, DefaultRouterHooks, RouterHooks};
pub use pipe::BoundedPipe;
pub use reader::{AsyncStreamReader, SyncStreamReader};
pub use router::{Router, RouterConfig};
