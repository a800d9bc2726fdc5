//! Application hooks around forwarded calls.

use std::any::Any;
use std::sync::Arc;

use tracing::{error, info};

use switchboard_server::RpcContext;
use switchboard_transport::Status;

/// Opaque per-call value associated by `on_call_begin` and handed back to
/// the later notifications of the same call.
pub type CallParam = Arc<dyn Any + Send + Sync>;

/// Notifications and diagnostics emitted by the router.
///
/// `on_call_begin` may reject the call by returning a non-OK status, which
/// the router propagates upstream without touching the downstream.
pub trait RouterHooks: Send + Sync {
    /// Called before a forward; the returned value is passed to the
    /// call-end and end-of-stream notifications.
    fn on_call_begin(&self, _ctx: &RpcContext) -> Result<Option<CallParam>, Status> {
        Ok(None)
    }

    /// Called once per forwarded call after its terminal transition.
    fn on_call_end(&self, _ctx: &RpcContext, _param: Option<&CallParam>) {}

    /// Called when a forwarded stream delivers its end-of-stream.
    fn on_end_of_stream(&self, _ctx: &RpcContext, _param: Option<&CallParam>) {}

    /// Router error reporting; defaults to `tracing`.
    fn on_error(&self, msg: &str) {
        error!(target: "switchboard", "{msg}");
    }

    /// Router informational reporting; defaults to `tracing`.
    fn on_info(&self, msg: &str) {
        info!(target: "switchboard", "{msg}");
    }
}

/// Hooks implementation that only logs.
#[derive(Debug, Default)]
pub struct DefaultRouterHooks;

impl RouterHooks for DefaultRouterHooks {}
