//! The router: serves a method upstream by calling it downstream.
//!
//! One router owns one client stub aimed at the downstream target. Unary
//! forwards run inline on the upstream worker; server-stream forwards run
//! through a sync or async bridge chosen at configuration time. The
//! downstream stream reader lives in the upstream context's per-call slot
//! across handler re-entries.

use std::sync::Arc;

use switchboard_client::ClientStub;
use switchboard_server::{
    ClientStreamContext, RpcContext, ServerStreamContext, StreamStatus,
};
use switchboard_transport::{MethodDescriptor, Status, StatusCode};

use crate::hooks::{CallParam, DefaultRouterHooks, RouterHooks};
use crate::reader::{AsyncStreamReader, SyncStreamReader};

/// Router tunables. The `Default` impl documents defaults.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Ceiling on the downstream timeout of a forwarded unary call, in
    /// milliseconds (default 5000).
    pub unary_timeout_ms: u64,
    /// Capacity of the async bridge's pipe (default 5).
    pub pipe_capacity: usize,
    /// Bridge streams through a producer thread instead of blocking the
    /// upstream worker on downstream reads (default false).
    pub async_forward: bool,
    /// Log successful forwards, not only failures (default false).
    pub verbose: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            unary_timeout_ms: 5000,
            pipe_capacity: 5,
            async_forward: false,
            verbose: false,
        }
    }
}

enum Bridge<Resp> {
    Sync(SyncStreamReader<Resp>),
    Async(AsyncStreamReader<Resp>),
}

impl<Resp> Bridge<Resp>
where
    Resp: Send + 'static,
{
    fn read(&mut self) -> Option<Resp> {
        match self {
            Bridge::Sync(reader) => reader.read(),
            Bridge::Async(reader) => reader.read(),
        }
    }

    fn status(&self) -> Status {
        match self {
            Bridge::Sync(reader) => reader.status(),
            Bridge::Async(reader) => reader.status(),
        }
    }

    fn stop(&mut self) {
        match self {
            Bridge::Sync(reader) => reader.stop(),
            Bridge::Async(reader) => reader.stop(),
        }
    }
}

struct BridgeState<Resp> {
    bridge: Bridge<Resp>,
    call_param: Option<CallParam>,
}

/// Forwards upstream calls to one downstream target.
pub struct Router {
    stub: Arc<ClientStub>,
    config: RouterConfig,
    hooks: Arc<dyn RouterHooks>,
}

impl Router {
    /// Creates a router aimed at `target_uri` with logging-only hooks.
    pub fn new(target_uri: &str, config: RouterConfig) -> Self {
        Self::with_hooks(target_uri, config, Arc::new(DefaultRouterHooks))
    }

    /// Creates a router with application hooks.
    pub fn with_hooks(
        target_uri: &str,
        config: RouterConfig,
        hooks: Arc<dyn RouterHooks>,
    ) -> Self {
        Self {
            stub: Arc::new(ClientStub::connected(target_uri)),
            config,
            hooks,
        }
    }

    /// The downstream client stub.
    pub fn target_stub(&self) -> &Arc<ClientStub> {
        &self.stub
    }

    /// Whether the downstream channel is currently set up.
    pub fn is_valid(&self) -> bool {
        self.stub.is_valid()
    }

    /// The router's configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn format_status_msg(&self, method: &str, status: &Status) -> String {
        let target = self.stub.address_uri().unwrap_or_default();
        let mut msg = format!(
            "req: {method}, status: {} ({}), to: {target}",
            status.code().as_str(),
            status.code().value()
        );
        if !status.is_ok() {
            msg.push_str(&format!(", err: '{}'", status.message()));
        }
        msg
    }

    /// Forwards a unary call downstream, honouring the upstream deadline.
    ///
    /// An already-expired deadline fails locally with DEADLINE_EXCEEDED;
    /// otherwise the downstream timeout is the remaining deadline capped
    /// at the configured unary timeout. A downstream failure resets the
    /// channel and surfaces upstream as INTERNAL with the formatted error.
    pub fn forward_unary<Req, Resp>(
        &self,
        ctx: &mut RpcContext,
        method: &MethodDescriptor<Req, Resp>,
        req: &Req,
        resp: &mut Resp,
    ) {
        let full_name = method.full_name();
        let call_param = match self.hooks.on_call_begin(ctx) {
            Ok(param) => param,
            Err(status) => {
                ctx.set_status(status.code(), status.message());
                let msg = self.format_status_msg(&full_name, ctx.status());
                self.hooks.on_error(&msg);
                self.hooks.on_call_end(ctx, None);
                return;
            }
        };

        let Some(remaining) = ctx.deadline().remaining() else {
            ctx.set_status(StatusCode::DeadlineExceeded, "Request already past deadline");
            let msg = self.format_status_msg(&full_name, ctx.status());
            self.hooks.on_error(&msg);
            self.hooks.on_call_end(ctx, call_param.as_ref());
            return;
        };
        let remaining_ms = remaining.as_millis().min(u64::MAX as u128) as u64;
        let timeout_ms = remaining_ms.min(self.config.unary_timeout_ms).max(1);

        let metadata = ctx.client_metadata().clone();
        match self.stub.call(method, req, &metadata, timeout_ms) {
            Ok(message) => {
                *resp = message;
                if self.config.verbose {
                    let msg = self.format_status_msg(&full_name, ctx.status());
                    self.hooks.on_info(&msg);
                }
            }
            Err(e) => {
                // Reset the channel so the broken connection is not reused.
                self.stub.reset();
                ctx.set_status(StatusCode::Internal, e.to_string());
                let msg = self.format_status_msg(&full_name, ctx.status());
                self.hooks.on_error(&msg);
            }
        }
        self.hooks.on_call_end(ctx, call_param.as_ref());
    }

    /// Forwards a server-streaming call downstream.
    ///
    /// Invoked once per upstream handler re-entry: the first entry opens
    /// the bridge, each later entry delivers one downstream response or
    /// terminates the upstream stream with the bridge's terminal status,
    /// and the terminal entry (stream status SUCCESS or ERROR) stops the
    /// bridge and releases it.
    pub fn forward_server_stream<Req, Resp>(
        &self,
        ctx: &mut ServerStreamContext,
        method: &MethodDescriptor<Req, Resp>,
        req: &Req,
        resp: &mut Resp,
    ) where
        Req: Clone + Send + 'static,
        Resp: Send + 'static,
    {
        let full_name = method.full_name();

        if matches!(
            ctx.stream_status(),
            StreamStatus::Success | StreamStatus::Error
        ) {
            if let Some(state) = ctx.take_param() {
                if let Ok(mut state) = state.downcast::<BridgeState<Resp>>() {
                    state.bridge.stop();
                    self.hooks.on_call_end(ctx, state.call_param.as_ref());
                }
            }
            return;
        }

        if ctx.param_ref::<BridgeState<Resp>>().is_none() {
            let call_param = match self.hooks.on_call_begin(ctx) {
                Ok(param) => param,
                Err(status) => {
                    ctx.set_has_more(false);
                    ctx.set_status(status.code(), status.message());
                    let msg = self.format_status_msg(&full_name, ctx.status());
                    self.hooks.on_error(&msg);
                    self.hooks.on_end_of_stream(ctx, None);
                    self.hooks.on_call_end(ctx, None);
                    return;
                }
            };
            let metadata = ctx.client_metadata().clone();
            let bridge = if self.config.async_forward {
                Bridge::Async(AsyncStreamReader::start(
                    self.stub.clone(),
                    *method,
                    req.clone(),
                    metadata,
                    self.config.pipe_capacity,
                    self.hooks.clone(),
                ))
            } else {
                Bridge::Sync(SyncStreamReader::start(
                    self.stub.clone(),
                    *method,
                    req,
                    metadata,
                    self.hooks.clone(),
                ))
            };
            ctx.set_param(Box::new(BridgeState { bridge, call_param }));
        }

        let step = match ctx.param_mut::<BridgeState<Resp>>() {
            Some(state) => match state.bridge.read() {
                Some(message) => Ok(message),
                None => Err(state.bridge.status()),
            },
            None => Err(Status::internal("stream bridge missing")),
        };

        match step {
            Ok(message) => {
                *resp = message;
                ctx.set_has_more(true);
            }
            Err(status) => {
                ctx.set_has_more(false);
                if status.is_ok() {
                    if self.config.verbose {
                        let msg = self.format_status_msg(&full_name, ctx.status());
                        self.hooks.on_info(&msg);
                    }
                } else {
                    ctx.set_status(status.code(), status.message());
                    let msg = self.format_status_msg(&full_name, ctx.status());
                    self.hooks.on_error(&msg);
                }
                let call_param = ctx
                    .param_ref::<BridgeState<Resp>>()
                    .and_then(|state| state.call_param.clone());
                self.hooks.on_end_of_stream(ctx, call_param.as_ref());
            }
        }
    }

    /// Forwarding a client-streaming call is not supported; the upstream
    /// call fails with INTERNAL.
    pub fn forward_client_stream<Req, Resp>(
        &self,
        ctx: &mut ClientStreamContext,
        _method: &MethodDescriptor<Req, Resp>,
        _req: &Req,
        _resp: &mut Resp,
    ) {
        ctx.set_status(StatusCode::Internal, "Not Implemented Yet");
    }
}
