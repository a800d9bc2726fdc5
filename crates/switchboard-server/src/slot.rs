//! Call slots: per-RPC state machines driven by completion-queue events.
//!
//! A slot is one pre-armed accept for one (service, method, shape) plus
//! the state machine that carries the accepted call through its reads,
//! writes, and finish. The slot's completion tag identifies it on the
//! worker's queue; at most one transport operation is outstanding per
//! slot at any time. When a slot leaves the accept state, the dispatcher
//! immediately arms a fresh clone so the method never loses accept
//! capacity; the finishing slot is destroyed once its terminal event is
//! consumed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use switchboard_transport::{
    accept_cell, read_cell, AcceptCell, CompletionQueue, MethodDescriptor, ReadCell, ServerCall,
    ServerTransport, Status, Tag,
};

use crate::context::{
    BindingParam, ClientStreamContext, RpcContext, ServerStreamContext, StreamStatus,
};
use crate::metrics::RegistryMetrics;
use crate::server::ServerHandler;

/// Unary handler: fills the response and reports failure via the context.
pub type UnaryHandlerFn<Req, Resp> = Box<dyn Fn(&mut RpcContext, &Req, &mut Resp) + Send + Sync>;

/// Server-stream handler, re-entered once per response.
pub type ServerStreamHandlerFn<Req, Resp> =
    Box<dyn Fn(&mut ServerStreamContext, &Req, &mut Resp) + Send + Sync>;

/// Client-stream handler, entered once per received request.
pub type ClientStreamHandlerFn<Req, Resp> =
    Box<dyn Fn(&mut ClientStreamContext, &Req, &mut Resp) + Send + Sync>;

/// Where a slot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Armed, waiting for a call to arrive.
    Accept,
    /// A client-stream read is outstanding.
    Read,
    /// The client half-closed; the final handler entry is due.
    ReadEnd,
    /// A response write is outstanding (or due for server streams).
    Write,
    /// The terminal operation is outstanding.
    Finish,
    /// Terminal; the dispatcher discards the slot.
    Done,
}

/// Everything a slot needs to drive its transport operations.
#[derive(Clone)]
pub(crate) struct SlotEnv {
    pub transport: ServerTransport,
    pub cq: Arc<CompletionQueue>,
    pub hooks: Arc<dyn ServerHandler>,
    pub metrics: Arc<RegistryMetrics>,
}

/// Mints a fresh completion tag for an armed slot.
pub(crate) fn fresh_tag() -> Tag {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Tag(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// The state-machine contract shared by the three call shapes.
pub(crate) trait ActiveSlot: Send {
    fn state(&self) -> SlotState;
    fn set_state(&mut self, state: SlotState);
    /// Re-arms the slot: fresh accept registered under `tag`.
    fn start(&mut self, tag: Tag, env: &SlotEnv);
    /// Drives the call forward after a successful completion.
    fn process(&mut self, env: &SlotEnv);
    /// Consumes the terminal (finish) completion.
    fn end(&mut self, env: &SlotEnv, is_error: bool);
    /// Aborts the call after a failed mid-call completion.
    fn fail(&mut self, env: &SlotEnv);
    /// Fresh accept-state clone of this slot's binding.
    fn clone_fresh(&self) -> Box<dyn ActiveSlot>;
    /// Fully-qualified method name, for diagnostics.
    fn full_name(&self) -> String;
}

/// Builds accept-state slots for one binding.
pub(crate) trait SlotFactory: Send + Sync {
    fn make(&self) -> Box<dyn ActiveSlot>;
    fn full_name(&self) -> String;
    fn kind(&self) -> switchboard_transport::MethodKind;
}

fn take_accepted(cell: &AcceptCell) -> Option<ServerCall> {
    cell.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn take_read(cell: &ReadCell) -> Option<bytes::Bytes> {
    cell.lock().unwrap_or_else(|e| e.into_inner()).take()
}

// ---------------------------------------------------------------------------
// Unary
// ---------------------------------------------------------------------------

pub(crate) struct UnaryBindingInner<Req, Resp> {
    pub desc: MethodDescriptor<Req, Resp>,
    pub handler: UnaryHandlerFn<Req, Resp>,
    pub param: Option<BindingParam>,
}

/// Factory for unary call slots.
pub(crate) struct UnaryBinding<Req, Resp> {
    pub inner: Arc<UnaryBindingInner<Req, Resp>>,
}

impl<Req, Resp> SlotFactory for UnaryBinding<Req, Resp>
where
    Req: Send + 'static,
    Resp: Default + Send + 'static,
{
    fn make(&self) -> Box<dyn ActiveSlot> {
        Box::new(UnarySlot {
            binding: self.inner.clone(),
            state: SlotState::Accept,
            tag: Tag(0),
            accept: accept_cell(),
            call: None,
        })
    }

    fn full_name(&self) -> String {
        self.inner.desc.full_name()
    }

    fn kind(&self) -> switchboard_transport::MethodKind {
        self.inner.desc.kind
    }
}

struct UnarySlot<Req, Resp> {
    binding: Arc<UnaryBindingInner<Req, Resp>>,
    state: SlotState,
    tag: Tag,
    accept: AcceptCell,
    call: Option<ServerCall>,
}

impl<Req, Resp> ActiveSlot for UnarySlot<Req, Resp>
where
    Req: Send + 'static,
    Resp: Default + Send + 'static,
{
    fn state(&self) -> SlotState {
        self.state
    }

    fn set_state(&mut self, state: SlotState) {
        self.state = state;
    }

    fn start(&mut self, tag: Tag, env: &SlotEnv) {
        self.state = SlotState::Accept;
        self.tag = tag;
        self.accept = accept_cell();
        self.call = None;
        env.transport
            .arm_accept(&self.binding.desc.full_name(), tag, &env.cq, &self.accept);
    }

    fn process(&mut self, env: &SlotEnv) {
        if self.state == SlotState::Accept {
            self.call = take_accepted(&self.accept);
            env.metrics.inc_accepted();
        }
        let Some(call) = &self.call else {
            env.hooks
                .on_error(&format!("no bound call for method '{}'", self.full_name()));
            self.state = SlotState::Done;
            return;
        };
        let payload = call.take_initial_payload().unwrap_or_default();
        let (status, response) = match (self.binding.desc.req.de)(&payload) {
            Err(e) => (
                Status::internal(format!("failed to decode request: {e}")),
                None,
            ),
            Ok(req) => {
                let mut ctx = RpcContext::new(call.details(), self.binding.param.clone());
                let mut resp = Resp::default();
                (self.binding.handler)(&mut ctx, &req, &mut resp);
                ctx.mark_finished();
                match (self.binding.desc.resp.ser)(&resp) {
                    Ok(bytes) => {
                        let trailing = ctx.trailing_metadata().clone();
                        self.state = SlotState::Finish;
                        call.finish(Some(bytes), ctx.status().clone(), trailing, self.tag, &env.cq);
                        return;
                    }
                    Err(e) => (
                        Status::internal(format!("failed to encode response: {e}")),
                        None,
                    ),
                }
            }
        };
        self.state = SlotState::Finish;
        call.finish(
            response,
            status,
            switchboard_transport::Metadata::new(),
            self.tag,
            &env.cq,
        );
    }

    fn end(&mut self, env: &SlotEnv, _is_error: bool) {
        env.metrics.inc_finished();
        self.state = SlotState::Done;
    }

    fn fail(&mut self, env: &SlotEnv) {
        env.metrics.inc_finished();
        self.state = SlotState::Done;
    }

    fn clone_fresh(&self) -> Box<dyn ActiveSlot> {
        Box::new(UnarySlot {
            binding: self.binding.clone(),
            state: SlotState::Accept,
            tag: Tag(0),
            accept: accept_cell(),
            call: None,
        })
    }

    fn full_name(&self) -> String {
        self.binding.desc.full_name()
    }
}

// ---------------------------------------------------------------------------
// Server streaming
// ---------------------------------------------------------------------------

pub(crate) struct ServerStreamBindingInner<Req, Resp> {
    pub desc: MethodDescriptor<Req, Resp>,
    pub handler: ServerStreamHandlerFn<Req, Resp>,
    pub param: Option<BindingParam>,
}

/// Factory for server-stream call slots.
pub(crate) struct ServerStreamBinding<Req, Resp> {
    pub inner: Arc<ServerStreamBindingInner<Req, Resp>>,
}

impl<Req, Resp> SlotFactory for ServerStreamBinding<Req, Resp>
where
    Req: Send + 'static,
    Resp: Default + Send + 'static,
{
    fn make(&self) -> Box<dyn ActiveSlot> {
        Box::new(ServerStreamSlot {
            binding: self.inner.clone(),
            state: SlotState::Accept,
            tag: Tag(0),
            accept: accept_cell(),
            call: None,
            req: None,
            ctx: None,
            stream_open: false,
        })
    }

    fn full_name(&self) -> String {
        self.inner.desc.full_name()
    }

    fn kind(&self) -> switchboard_transport::MethodKind {
        self.inner.desc.kind
    }
}

struct ServerStreamSlot<Req, Resp> {
    binding: Arc<ServerStreamBindingInner<Req, Resp>>,
    state: SlotState,
    tag: Tag,
    accept: AcceptCell,
    call: Option<ServerCall>,
    req: Option<Req>,
    ctx: Option<ServerStreamContext>,
    stream_open: bool,
}

impl<Req, Resp> ServerStreamSlot<Req, Resp>
where
    Req: Send + 'static,
    Resp: Default + Send + 'static,
{
    fn close_stream_metric(&mut self, env: &SlotEnv) {
        if self.stream_open {
            env.metrics.stream_closed();
            self.stream_open = false;
        }
    }

    /// Runs the handler once in a terminal stream state so it can release
    /// per-call state. Safe to call more than once; the handler observes an
    /// empty user slot on later entries.
    fn cleanup_entry(&mut self, env: &SlotEnv, status: StreamStatus) {
        if let (Some(ctx), Some(req)) = (self.ctx.as_mut(), self.req.as_ref()) {
            ctx.set_stream_status(status);
            ctx.mark_finished();
            let mut dummy = Resp::default();
            (self.binding.handler)(ctx, req, &mut dummy);
        }
        self.close_stream_metric(env);
    }
}

impl<Req, Resp> ActiveSlot for ServerStreamSlot<Req, Resp>
where
    Req: Send + 'static,
    Resp: Default + Send + 'static,
{
    fn state(&self) -> SlotState {
        self.state
    }

    fn set_state(&mut self, state: SlotState) {
        self.state = state;
    }

    fn start(&mut self, tag: Tag, env: &SlotEnv) {
        self.state = SlotState::Accept;
        self.tag = tag;
        self.accept = accept_cell();
        self.call = None;
        self.req = None;
        self.ctx = None;
        self.stream_open = false;
        env.transport
            .arm_accept(&self.binding.desc.full_name(), tag, &env.cq, &self.accept);
    }

    fn process(&mut self, env: &SlotEnv) {
        if self.state == SlotState::Accept {
            self.call = take_accepted(&self.accept);
            env.metrics.inc_accepted();
            let Some(call) = &self.call else {
                env.hooks
                    .on_error(&format!("no bound call for method '{}'", self.full_name()));
                self.state = SlotState::Done;
                return;
            };
            let payload = call.take_initial_payload().unwrap_or_default();
            match (self.binding.desc.req.de)(&payload) {
                Ok(req) => {
                    self.req = Some(req);
                    self.ctx = Some(ServerStreamContext::new(
                        call.details(),
                        self.binding.param.clone(),
                    ));
                    self.state = SlotState::Write;
                    self.stream_open = true;
                    env.metrics.stream_opened();
                }
                Err(e) => {
                    self.state = SlotState::Finish;
                    call.finish(
                        None,
                        Status::internal(format!("failed to decode request: {e}")),
                        switchboard_transport::Metadata::new(),
                        self.tag,
                        &env.cq,
                    );
                    return;
                }
            }
        }

        let (Some(call), Some(ctx), Some(req)) =
            (self.call.as_ref(), self.ctx.as_mut(), self.req.as_ref())
        else {
            env.hooks.on_error(&format!(
                "stream state lost for method '{}'",
                self.binding.desc.full_name()
            ));
            self.state = SlotState::Done;
            return;
        };

        let mut resp = Resp::default();
        (self.binding.handler)(ctx, req, &mut resp);

        if ctx.has_more() {
            match (self.binding.desc.resp.ser)(&resp) {
                Ok(bytes) => call.start_write(bytes, self.tag, &env.cq),
                Err(e) => {
                    let status = Status::internal(format!("failed to encode response: {e}"));
                    self.state = SlotState::Finish;
                    call.finish(
                        None,
                        status,
                        switchboard_transport::Metadata::new(),
                        self.tag,
                        &env.cq,
                    );
                }
            }
        } else {
            let status = ctx.status().clone();
            let trailing = ctx.trailing_metadata().clone();
            self.state = SlotState::Finish;
            call.finish(None, status, trailing, self.tag, &env.cq);
        }
    }

    fn end(&mut self, env: &SlotEnv, is_error: bool) {
        if self.ctx.is_some() {
            if is_error {
                env.hooks.on_error(&format!(
                    "error finishing stream for method '{}'",
                    self.full_name()
                ));
            }
            let status = if is_error {
                StreamStatus::Error
            } else {
                StreamStatus::Success
            };
            self.cleanup_entry(env, status);
        } else {
            env.hooks.on_error(&format!(
                "ending stream that never started for method '{}'",
                self.full_name()
            ));
        }
        env.metrics.inc_finished();
        self.state = SlotState::Done;
    }

    fn fail(&mut self, env: &SlotEnv) {
        // A mid-stream write failed: give the handler its terminal entry,
        // then issue the finish so the call is torn down on the transport.
        self.cleanup_entry(env, StreamStatus::Error);
        let (status, trailing) = match self.ctx.as_ref() {
            Some(ctx) => (ctx.status().clone(), ctx.trailing_metadata().clone()),
            None => (Status::ok(), switchboard_transport::Metadata::new()),
        };
        match self.call.as_ref() {
            Some(call) => {
                self.state = SlotState::Finish;
                call.finish(None, status, trailing, self.tag, &env.cq);
            }
            None => {
                env.metrics.inc_finished();
                self.state = SlotState::Done;
            }
        }
    }

    fn clone_fresh(&self) -> Box<dyn ActiveSlot> {
        Box::new(ServerStreamSlot {
            binding: self.binding.clone(),
            state: SlotState::Accept,
            tag: Tag(0),
            accept: accept_cell(),
            call: None,
            req: None,
            ctx: None,
            stream_open: false,
        })
    }

    fn full_name(&self) -> String {
        self.binding.desc.full_name()
    }
}

// ---------------------------------------------------------------------------
// Client streaming
// ---------------------------------------------------------------------------

pub(crate) struct ClientStreamBindingInner<Req, Resp> {
    pub desc: MethodDescriptor<Req, Resp>,
    pub handler: ClientStreamHandlerFn<Req, Resp>,
    pub param: Option<BindingParam>,
}

/// Factory for client-stream call slots.
pub(crate) struct ClientStreamBinding<Req, Resp> {
    pub inner: Arc<ClientStreamBindingInner<Req, Resp>>,
}

impl<Req, Resp> SlotFactory for ClientStreamBinding<Req, Resp>
where
    Req: Default + Send + 'static,
    Resp: Default + Send + 'static,
{
    fn make(&self) -> Box<dyn ActiveSlot> {
        Box::new(ClientStreamSlot {
            binding: self.inner.clone(),
            state: SlotState::Accept,
            tag: Tag(0),
            accept: accept_cell(),
            call: None,
            read_dst: read_cell(),
            ctx: None,
            resp: Resp::default(),
        })
    }

    fn full_name(&self) -> String {
        self.inner.desc.full_name()
    }

    fn kind(&self) -> switchboard_transport::MethodKind {
        self.inner.desc.kind
    }
}

struct ClientStreamSlot<Req, Resp> {
    binding: Arc<ClientStreamBindingInner<Req, Resp>>,
    state: SlotState,
    tag: Tag,
    accept: AcceptCell,
    call: Option<ServerCall>,
    read_dst: ReadCell,
    ctx: Option<ClientStreamContext>,
    resp: Resp,
}

impl<Req, Resp> ActiveSlot for ClientStreamSlot<Req, Resp>
where
    Req: Default + Send + 'static,
    Resp: Default + Send + 'static,
{
    fn state(&self) -> SlotState {
        self.state
    }

    fn set_state(&mut self, state: SlotState) {
        self.state = state;
    }

    fn start(&mut self, tag: Tag, env: &SlotEnv) {
        self.state = SlotState::Accept;
        self.tag = tag;
        self.accept = accept_cell();
        self.call = None;
        self.read_dst = read_cell();
        self.ctx = None;
        self.resp = Resp::default();
        env.transport
            .arm_accept(&self.binding.desc.full_name(), tag, &env.cq, &self.accept);
    }

    fn process(&mut self, env: &SlotEnv) {
        match self.state {
            SlotState::Accept => {
                self.call = take_accepted(&self.accept);
                env.metrics.inc_accepted();
                let Some(call) = &self.call else {
                    env.hooks
                        .on_error(&format!("no bound call for method '{}'", self.full_name()));
                    self.state = SlotState::Done;
                    return;
                };
                self.ctx = Some(ClientStreamContext::new(
                    call.details(),
                    self.binding.param.clone(),
                ));
                self.state = SlotState::Read;
                call.start_read(&self.read_dst, self.tag, &env.cq);
            }
            SlotState::Read => {
                let (Some(call), Some(ctx)) = (self.call.as_ref(), self.ctx.as_mut()) else {
                    self.state = SlotState::Done;
                    return;
                };
                let payload = take_read(&self.read_dst).unwrap_or_default();
                let req = match (self.binding.desc.req.de)(&payload) {
                    Ok(req) => req,
                    Err(e) => {
                        self.state = SlotState::Finish;
                        call.finish(
                            None,
                            Status::internal(format!("failed to decode request: {e}")),
                            switchboard_transport::Metadata::new(),
                            self.tag,
                            &env.cq,
                        );
                        return;
                    }
                };
                (self.binding.handler)(ctx, &req, &mut self.resp);
                if !ctx.status().is_ok() {
                    // Handler rejected the stream mid-flight.
                    let status = ctx.status().clone();
                    let trailing = ctx.trailing_metadata().clone();
                    ctx.mark_finished();
                    self.state = SlotState::Finish;
                    call.finish(None, status, trailing, self.tag, &env.cq);
                    return;
                }
                call.start_read(&self.read_dst, self.tag, &env.cq);
            }
            SlotState::ReadEnd => {
                let (Some(call), Some(ctx)) = (self.call.as_ref(), self.ctx.as_mut()) else {
                    self.state = SlotState::Done;
                    return;
                };
                ctx.set_has_more(false);
                self.resp = Resp::default();
                let final_req = Req::default();
                (self.binding.handler)(ctx, &final_req, &mut self.resp);
                ctx.mark_finished();
                let trailing = ctx.trailing_metadata().clone();
                self.state = SlotState::Finish;
                match (self.binding.desc.resp.ser)(&self.resp) {
                    Ok(bytes) => {
                        call.finish(Some(bytes), ctx.status().clone(), trailing, self.tag, &env.cq)
                    }
                    Err(e) => call.finish(
                        None,
                        Status::internal(format!("failed to encode response: {e}")),
                        trailing,
                        self.tag,
                        &env.cq,
                    ),
                }
            }
            other => {
                env.hooks.on_error(&format!(
                    "unexpected client-stream state {other:?} for method '{}'",
                    self.full_name()
                ));
                self.state = SlotState::Done;
            }
        }
    }

    fn end(&mut self, env: &SlotEnv, _is_error: bool) {
        env.metrics.inc_finished();
        self.state = SlotState::Done;
    }

    fn fail(&mut self, env: &SlotEnv) {
        env.metrics.inc_finished();
        self.state = SlotState::Done;
    }

    fn clone_fresh(&self) -> Box<dyn ActiveSlot> {
        Box::new(ClientStreamSlot {
            binding: self.binding.clone(),
            state: SlotState::Accept,
            tag: Tag(0),
            accept: accept_cell(),
            call: None,
            read_dst: read_cell(),
            ctx: None,
            resp: Resp::default(),
        })
    }

    fn full_name(&self) -> String {
        self.binding.desc.full_name()
    }
}
