//! Scenario services hosted by the test servers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use switchboard_router::Router;
use switchboard_server::{
    ClientStreamContext, Service, ServiceBinder, ServerStreamContext, StreamStatus,
};
use switchboard_transport::{is_local_peer, Status, StatusCode};

use crate::messages::*;

/// The reference service: ping, echo, shutdown, and both stream shapes.
pub struct TestService;

struct ResponseRows {
    rows: Vec<String>,
    sent: usize,
}

impl TestService {
    fn ping(ctx: &mut switchboard_server::RpcContext, _req: &PingRequest, resp: &mut PingResponse) {
        info!(
            peer = ctx.peer(),
            sessionid = ctx.metadata("sessionid").unwrap_or(""),
            requestid = ctx.metadata("requestid").unwrap_or(""),
            "ping"
        );
        resp.result = true;
        resp.msg = "Pong".to_string();
    }

    fn echo(ctx: &mut switchboard_server::RpcContext, req: &EchoRequest, resp: &mut EchoResponse) {
        resp.msg = req.msg.clone();
        resp.blob = req.blob.clone();
        ctx.add_trailing_metadata("echo-len", &req.blob.len().to_string());
    }

    fn server_stream(
        ctx: &mut ServerStreamContext,
        req: &ServerStreamRequest,
        resp: &mut ServerStreamResponse,
    ) {
        match ctx.stream_status() {
            StreamStatus::Success | StreamStatus::Error => {
                let sent = ctx.param_ref::<ResponseRows>().map(|r| r.sent).unwrap_or(0);
                debug!(sent, terminal = ?ctx.stream_status(), "server stream closed");
                ctx.take_param();
            }
            StreamStatus::Streaming => {
                if ctx.param_ref::<ResponseRows>().is_none() {
                    debug!(req = %req.msg, "server stream opened");
                    let rows = (1..=10)
                        .map(|i| format!("ServerStreamTestResponse #{i}"))
                        .collect();
                    ctx.set_param(Box::new(ResponseRows { rows, sent: 0 }));
                }
                let next = ctx.param_mut::<ResponseRows>().and_then(|state| {
                    if state.sent < state.rows.len() {
                        let line = format!("Resp[{}]: '{}'", state.sent + 1, state.rows[state.sent]);
                        state.sent += 1;
                        Some(line)
                    } else {
                        None
                    }
                });
                match next {
                    Some(line) => {
                        resp.msg = line;
                        resp.result = true;
                        ctx.set_has_more(true);
                    }
                    None => ctx.set_has_more(false),
                }
            }
        }
    }

    fn client_stream(
        ctx: &mut ClientStreamContext,
        req: &ClientStreamRequest,
        resp: &mut ClientStreamResponse,
    ) {
        if ctx.has_more() {
            if ctx.param_ref::<u32>().is_none() {
                ctx.set_param(Box::new(0u32));
            }
            if let Some(count) = ctx.param_mut::<u32>() {
                *count += 1;
            }
            debug!(msg = %req.msg, "client stream request");
        } else {
            let received = ctx
                .take_param()
                .and_then(|slot| slot.downcast::<u32>().ok())
                .map(|count| *count)
                .unwrap_or(0);
            resp.result = true;
            resp.received = received;
        }
    }
}

impl Service for TestService {
    fn name(&self) -> &'static str {
        TEST_SERVICE
    }

    fn on_init(self: Arc<Self>, binder: &mut ServiceBinder) -> bool {
        let handle = binder.server_handle();
        binder
            .bind_unary(ping_method(), None, |ctx, req, resp| {
                Self::ping(ctx, req, resp)
            })
            .is_ok()
            && binder
                .bind_unary(echo_method(), None, |ctx, req, resp| {
                    Self::echo(ctx, req, resp)
                })
                .is_ok()
            && binder
                .bind_unary(shutdown_method(), None, move |ctx, _req, resp| {
                    if is_local_peer(ctx.peer()) {
                        info!(peer = ctx.peer(), "shutdown from local client");
                        handle.shutdown();
                        resp.result = true;
                    } else {
                        info!(
                            peer = ctx.peer(),
                            "shutdown from remote client is not allowed"
                        );
                        resp.result = false;
                        resp.msg = "Shutdown from remote client is not allowed".to_string();
                    }
                })
                .is_ok()
            && binder
                .bind_server_stream(server_stream_method(), None, |ctx, req, resp| {
                    Self::server_stream(ctx, req, resp)
                })
                .is_ok()
            && binder
                .bind_client_stream(client_stream_method(), None, |ctx, req, resp| {
                    Self::client_stream(ctx, req, resp)
                })
                .is_ok()
    }
}

/// Knobs and counters for the downstream target used in router suites.
#[derive(Default)]
pub struct DownstreamBehavior {
    /// Artificial delay of every unary call, in milliseconds.
    pub unary_delay_ms: AtomicU64,
    /// Responses each stream call produces.
    pub stream_total: AtomicUsize,
    /// Fail the stream with [`DownstreamBehavior::fail_status`] after this
    /// many responses (usize::MAX = never).
    pub fail_after: AtomicUsize,
    fail_status: std::sync::Mutex<Option<Status>>,
    /// Unary calls observed.
    pub unary_calls: AtomicUsize,
    /// Stream responses produced across all calls.
    pub stream_sent: AtomicUsize,
}

impl DownstreamBehavior {
    pub fn new() -> Arc<Self> {
        let behavior = Self::default();
        behavior.stream_total.store(10, Ordering::SeqCst);
        behavior.fail_after.store(usize::MAX, Ordering::SeqCst);
        Arc::new(behavior)
    }

    pub fn set_fail(&self, after: usize, code: StatusCode, message: &str) {
        self.fail_after.store(after, Ordering::SeqCst);
        *self
            .fail_status
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Status::new(code, message));
    }

    fn fail_status(&self) -> Status {
        self.fail_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| Status::unavailable("downstream failure"))
    }
}

/// Downstream service with scriptable delays and failures.
pub struct DownstreamService {
    pub behavior: Arc<DownstreamBehavior>,
}

struct StreamProgress {
    sent: usize,
}

impl Service for DownstreamService {
    fn name(&self) -> &'static str {
        TEST_SERVICE
    }

    fn on_init(self: Arc<Self>, binder: &mut ServiceBinder) -> bool {
        let ping_behavior = self.behavior.clone();
        let stream_behavior = self.behavior.clone();
        binder
            .bind_unary(ping_method(), None, move |_ctx, _req, resp| {
                ping_behavior.unary_calls.fetch_add(1, Ordering::SeqCst);
                let delay = ping_behavior.unary_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    std::thread::sleep(Duration::from_millis(delay));
                }
                resp.result = true;
                resp.msg = "Pong".to_string();
            })
            .is_ok()
            && binder
                .bind_server_stream(server_stream_method(), None, move |ctx, _req, resp| {
                    match ctx.stream_status() {
                        StreamStatus::Success | StreamStatus::Error => {
                            ctx.take_param();
                        }
                        StreamStatus::Streaming => {
                            if ctx.param_ref::<StreamProgress>().is_none() {
                                ctx.set_param(Box::new(StreamProgress { sent: 0 }));
                            }
                            let total = stream_behavior.stream_total.load(Ordering::SeqCst);
                            let fail_after = stream_behavior.fail_after.load(Ordering::SeqCst);
                            let sent = ctx
                                .param_ref::<StreamProgress>()
                                .map(|p| p.sent)
                                .unwrap_or(0);
                            if sent >= fail_after {
                                // Let in-flight responses reach the consumer
                                // before the terminal status races them.
                                std::thread::sleep(Duration::from_millis(50));
                                let status = stream_behavior.fail_status();
                                ctx.set_has_more(false);
                                ctx.set_status(status.code(), status.message());
                            } else if sent < total {
                                if let Some(progress) = ctx.param_mut::<StreamProgress>() {
                                    progress.sent += 1;
                                }
                                stream_behavior.stream_sent.fetch_add(1, Ordering::SeqCst);
                                resp.result = true;
                                resp.msg = format!("DownstreamResponse #{}", sent + 1);
                                ctx.set_has_more(true);
                            } else {
                                ctx.set_has_more(false);
                            }
                        }
                    }
                })
                .is_ok()
    }
}

/// Upstream service whose handlers forward every call through a router.
pub struct RouterService {
    pub router: Arc<Router>,
}

impl Service for RouterService {
    fn name(&self) -> &'static str {
        TEST_SERVICE
    }

    fn on_init(self: Arc<Self>, binder: &mut ServiceBinder) -> bool {
        let unary_router = self.router.clone();
        let stream_router = self.router.clone();
        let client_stream_router = self.router.clone();
        binder
            .bind_unary(ping_method(), None, move |ctx, req, resp| {
                unary_router.forward_unary(ctx, &ping_method(), req, resp);
            })
            .is_ok()
            && binder
                .bind_server_stream(server_stream_method(), None, move |ctx, req, resp| {
                    stream_router.forward_server_stream(ctx, &server_stream_method(), req, resp);
                })
                .is_ok()
            && binder
                .bind_client_stream(client_stream_method(), None, move |ctx, req, resp| {
                    client_stream_router.forward_client_stream(
                        ctx,
                        &client_stream_method(),
                        req,
                        resp,
                    );
                })
                .is_ok()
    }
}
