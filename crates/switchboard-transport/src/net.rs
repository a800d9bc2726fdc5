//! In-memory transport provider.
//!
//! Implements the completion-queue transport contract over an in-process
//! endpoint table, so servers and clients built on the framework can be
//! exercised end to end without real sockets. Server-side operations never
//! block: each one completes by posting `(tag, ok)` onto the completion
//! queue it was issued against, exactly like a real event-driven transport.
//! Client-side surfaces are blocking, mirroring a synchronous stub library.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::codec::MethodKind;
use crate::deadline::Deadline;
use crate::error::{Result, TransportError};
use crate::metadata::Metadata;
use crate::queue::{CompletionQueue, Tag};
use crate::status::Status;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Immutable per-call attributes captured at call creation.
#[derive(Debug, Clone)]
pub struct CallDetails {
    /// Transport peer string of the caller (escaped form).
    pub peer: String,
    /// Client metadata sent with the call.
    pub metadata: Metadata,
    /// Call deadline.
    pub deadline: Deadline,
}

#[derive(Debug, Clone)]
struct FinishRecord {
    payload: Option<Bytes>,
    status: Status,
    trailing: Metadata,
}

struct PendingRead {
    tag: Tag,
    cq: Arc<CompletionQueue>,
    dst: ReadCell,
}

#[derive(Default)]
struct InboundState {
    queue: VecDeque<Bytes>,
    closed: bool,
    pending_read: Option<PendingRead>,
}

#[derive(Default)]
struct OutboundState {
    queue: VecDeque<Bytes>,
    finish: Option<FinishRecord>,
}

struct CallCore {
    details: CallDetails,
    initial: Mutex<Option<Bytes>>,
    inbound: Mutex<InboundState>,
    outbound: Mutex<OutboundState>,
    outbound_ready: Condvar,
    cancelled: AtomicBool,
}

impl CallCore {
    fn new(details: CallDetails, initial: Option<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            details,
            initial: Mutex::new(initial),
            inbound: Mutex::new(InboundState::default()),
            outbound: Mutex::new(OutboundState::default()),
            outbound_ready: Condvar::new(),
            cancelled: AtomicBool::new(false),
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.outbound_ready.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_finish(&self, record: FinishRecord) {
        let mut outbound = lock(&self.outbound);
        if outbound.finish.is_none() {
            outbound.finish = Some(record);
        }
        self.outbound_ready.notify_all();
    }
}

/// Destination cell for an asynchronous server-side read.
pub type ReadCell = Arc<Mutex<Option<Bytes>>>;

/// Creates an empty read cell.
pub fn read_cell() -> ReadCell {
    Arc::new(Mutex::new(None))
}

/// Server-side handle to one in-flight call.
///
/// Every operation completes by posting `(tag, ok)` to the supplied
/// completion queue; the issuer must keep at most one operation
/// outstanding at a time.
pub struct ServerCall {
    core: Arc<CallCore>,
}

impl ServerCall {
    /// Peer, metadata, and deadline of the call.
    pub fn details(&self) -> &CallDetails {
        &self.core.details
    }

    /// Takes the request payload delivered with the accept (unary and
    /// server-stream shapes).
    pub fn take_initial_payload(&self) -> Option<Bytes> {
        lock(&self.core.initial).take()
    }

    /// Returns `true` once the client has cancelled the call.
    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Issues a read of the next client message. Completes `ok=true` with
    /// the payload stored in `dst`, or `ok=false` once the client
    /// half-closed (or the call died).
    pub fn start_read(&self, dst: &ReadCell, tag: Tag, cq: &Arc<CompletionQueue>) {
        if self.core.is_cancelled() {
            cq.post(tag, false);
            return;
        }
        let mut inbound = lock(&self.core.inbound);
        if let Some(payload) = inbound.queue.pop_front() {
            *lock(dst) = Some(payload);
            cq.post(tag, true);
        } else if inbound.closed {
            cq.post(tag, false);
        } else {
            inbound.pending_read = Some(PendingRead {
                tag,
                cq: cq.clone(),
                dst: dst.clone(),
            });
        }
    }

    /// Issues a response-stream write. Completes `ok=false` when the client
    /// cancelled, which is how upstream cancellation is observed.
    pub fn start_write(&self, payload: Bytes, tag: Tag, cq: &Arc<CompletionQueue>) {
        if self.core.is_cancelled() {
            cq.post(tag, false);
            return;
        }
        {
            let mut outbound = lock(&self.core.outbound);
            outbound.queue.push_back(payload);
        }
        self.core.outbound_ready.notify_all();
        cq.post(tag, true);
    }

    /// Issues the terminal operation of the call, optionally carrying a
    /// final response payload (unary and client-stream shapes).
    pub fn finish(
        &self,
        payload: Option<Bytes>,
        status: Status,
        trailing: Metadata,
        tag: Tag,
        cq: &Arc<CompletionQueue>,
    ) {
        if self.core.is_cancelled() {
            // The caller is gone; surface CANCELLED on the client side and
            // report the failed completion to the issuing slot.
            self.core.set_finish(FinishRecord {
                payload: None,
                status: Status::cancelled("call was cancelled"),
                trailing: Metadata::new(),
            });
            cq.post(tag, false);
            return;
        }
        self.core.set_finish(FinishRecord {
            payload,
            status,
            trailing,
        });
        cq.post(tag, true);
    }
}

struct Acceptor {
    tag: Tag,
    cq: Arc<CompletionQueue>,
    cell: AcceptCell,
}

/// Cell an armed acceptor deposits the bound call into.
pub type AcceptCell = Arc<Mutex<Option<ServerCall>>>;

/// Creates an empty accept cell.
pub fn accept_cell() -> AcceptCell {
    Arc::new(Mutex::new(None))
}

#[derive(Default)]
struct MethodQueue {
    acceptors: VecDeque<Acceptor>,
    waiting: VecDeque<Arc<CallCore>>,
}

struct ServerTransportCore {
    uris: Vec<String>,
    methods: HashMap<String, MethodKind>,
    rendezvous: Mutex<HashMap<String, MethodQueue>>,
    shutting_down: AtomicBool,
}

fn registry() -> &'static DashMap<String, Arc<ServerTransportCore>> {
    static REGISTRY: OnceLock<DashMap<String, Arc<ServerTransportCore>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Server side of the in-memory transport: a set of bound endpoints
/// sharing one accept table.
#[derive(Clone)]
pub struct ServerTransport {
    core: Arc<ServerTransportCore>,
}

impl ServerTransport {
    /// Binds the given endpoint URIs and installs the method table.
    /// Calls to methods not present in the table fail with UNIMPLEMENTED.
    pub fn bind(uris: &[String], methods: HashMap<String, MethodKind>) -> Result<Self> {
        let core = Arc::new(ServerTransportCore {
            uris: uris.to_vec(),
            methods,
            rendezvous: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        });
        let mut bound: Vec<String> = Vec::new();
        for uri in uris {
            let entry = registry().entry(uri.clone());
            match entry {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    for prev in &bound {
                        registry().remove(prev);
                    }
                    return Err(TransportError::EndpointInUse { uri: uri.clone() });
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(core.clone());
                    bound.push(uri.clone());
                }
            }
        }
        debug!(endpoints = ?uris, "transport bound");
        Ok(Self { core })
    }

    /// Arms one accept for `full_method`. Completes `ok=true` with the new
    /// call stored in `cell` when a client arrives, or `ok=false` when the
    /// transport is shutting down.
    pub fn arm_accept(
        &self,
        full_method: &str,
        tag: Tag,
        cq: &Arc<CompletionQueue>,
        cell: &AcceptCell,
    ) {
        if self.core.shutting_down.load(Ordering::SeqCst) {
            cq.post(tag, false);
            return;
        }
        let mut rendezvous = lock(&self.core.rendezvous);
        let queue = rendezvous.entry(full_method.to_string()).or_default();
        if let Some(call) = queue.waiting.pop_front() {
            *lock(cell) = Some(ServerCall { core: call });
            cq.post(tag, true);
        } else {
            queue.acceptors.push_back(Acceptor {
                tag,
                cq: cq.clone(),
                cell: cell.clone(),
            });
        }
    }

    /// Stops accepting: armed acceptors complete `ok=false`, queued and
    /// future calls fail UNAVAILABLE, and the endpoints are released.
    pub fn shutdown(&self) {
        if self.core.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for uri in &self.core.uris {
            registry().remove(uri);
        }
        let mut rendezvous = lock(&self.core.rendezvous);
        for (_, queue) in rendezvous.iter_mut() {
            while let Some(acceptor) = queue.acceptors.pop_front() {
                acceptor.cq.post(acceptor.tag, false);
            }
            while let Some(call) = queue.waiting.pop_front() {
                call.set_finish(FinishRecord {
                    payload: None,
                    status: Status::unavailable("server is shutting down"),
                    trailing: Metadata::new(),
                });
            }
        }
        debug!(endpoints = ?self.core.uris, "transport shut down");
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        if Arc::strong_count(&self.core) == 1 {
            self.shutdown();
        }
    }
}

fn deliver(target: &str, full_method: &str, kind: MethodKind, call: &Arc<CallCore>) {
    let Some(core) = registry().get(target).map(|e| e.value().clone()) else {
        call.set_finish(FinishRecord {
            payload: None,
            status: Status::unavailable(format!("failed to connect to '{target}'")),
            trailing: Metadata::new(),
        });
        return;
    };
    match core.methods.get(full_method) {
        None => {
            call.set_finish(FinishRecord {
                payload: None,
                status: Status::unimplemented(format!("unknown method '{full_method}'")),
                trailing: Metadata::new(),
            });
            return;
        }
        Some(bound_kind) if *bound_kind != kind => {
            call.set_finish(FinishRecord {
                payload: None,
                status: Status::unimplemented(format!(
                    "method '{full_method}' registered with a different shape"
                )),
                trailing: Metadata::new(),
            });
            return;
        }
        Some(_) => {}
    }
    if core.shutting_down.load(Ordering::SeqCst) {
        call.set_finish(FinishRecord {
            payload: None,
            status: Status::unavailable("server is shutting down"),
            trailing: Metadata::new(),
        });
        return;
    }
    let mut rendezvous = lock(&core.rendezvous);
    let queue = rendezvous.entry(full_method.to_string()).or_default();
    if let Some(acceptor) = queue.acceptors.pop_front() {
        *lock(&acceptor.cell) = Some(ServerCall { core: call.clone() });
        acceptor.cq.post(acceptor.tag, true);
    } else {
        queue.waiting.push_back(call.clone());
    }
}

fn next_ephemeral_port() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    49152 + NEXT.fetch_add(1, Ordering::Relaxed) % 16000
}

fn synth_peer(target: &str) -> String {
    if let Some(path) = target.strip_prefix("unix://") {
        format!("unix:{path}")
    } else if let Some(name) = target.strip_prefix("unix-abstract:") {
        format!("unix:{name}")
    } else if target.contains('[') {
        // IPv6 loopback, escaped the way wire transports report it.
        format!("ipv6:%5B::1%5D:{}", next_ephemeral_port())
    } else {
        format!("ipv4:127.0.0.1:{}", next_ephemeral_port())
    }
}

/// Configuration of a client channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Largest payload the channel will send (default: unlimited).
    pub max_send_size: usize,
    /// Largest payload the channel will accept (default: unlimited).
    pub max_recv_size: usize,
    /// Overrides the synthesized peer string the server observes.
    /// Simulation affordance for exercising peer-based policies.
    pub peer_override: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_send_size: usize::MAX,
            max_recv_size: usize::MAX,
            peer_override: None,
        }
    }
}

/// Result of a unary call at the transport level.
#[derive(Debug, Clone)]
pub struct UnaryOutcome {
    /// Response payload, present when the status is OK.
    pub payload: Option<Bytes>,
    /// Transport status of the call.
    pub status: Status,
    /// Trailing metadata set by the server.
    pub trailing: Metadata,
}

/// Client-side connection to an endpoint.
///
/// Connection establishment is lazy: an unreachable endpoint surfaces as
/// UNAVAILABLE at call time, not at construction.
#[derive(Clone)]
pub struct Channel {
    target: String,
    config: ChannelConfig,
}

impl Channel {
    /// Creates a channel aimed at `target` with default configuration.
    pub fn connect(target: &str) -> Self {
        Self::connect_with(target, ChannelConfig::default())
    }

    /// Creates a channel aimed at `target`.
    pub fn connect_with(target: &str, config: ChannelConfig) -> Self {
        Self {
            target: target.to_string(),
            config,
        }
    }

    /// The endpoint URI this channel dials.
    pub fn target(&self) -> &str {
        &self.target
    }

    fn details(&self, metadata: Metadata, deadline: Deadline) -> CallDetails {
        let peer = self
            .config
            .peer_override
            .clone()
            .unwrap_or_else(|| synth_peer(&self.target));
        CallDetails {
            peer,
            metadata,
            deadline,
        }
    }

    /// Issues a unary call and blocks until a response, a terminal status,
    /// or the deadline.
    pub fn unary(
        &self,
        full_method: &str,
        payload: Bytes,
        metadata: Metadata,
        deadline: Deadline,
    ) -> UnaryOutcome {
        if payload.len() > self.config.max_send_size {
            return UnaryOutcome {
                payload: None,
                status: Status::new(
                    crate::status::StatusCode::ResourceExhausted,
                    format!(
                        "request of {} bytes exceeds send limit of {}",
                        payload.len(),
                        self.config.max_send_size
                    ),
                ),
                trailing: Metadata::new(),
            };
        }
        let call = CallCore::new(self.details(metadata, deadline), Some(payload));
        deliver(&self.target, full_method, MethodKind::Unary, &call);
        self.wait_unary(&call, deadline)
    }

    fn wait_unary(&self, call: &Arc<CallCore>, deadline: Deadline) -> UnaryOutcome {
        let mut outbound = lock(&call.outbound);
        loop {
            if let Some(record) = outbound.finish.clone() {
                if let Some(payload) = &record.payload {
                    if payload.len() > self.config.max_recv_size {
                        return UnaryOutcome {
                            payload: None,
                            status: Status::new(
                                crate::status::StatusCode::ResourceExhausted,
                                format!(
                                    "response of {} bytes exceeds receive limit of {}",
                                    payload.len(),
                                    self.config.max_recv_size
                                ),
                            ),
                            trailing: record.trailing,
                        };
                    }
                }
                return UnaryOutcome {
                    payload: record.payload,
                    status: record.status,
                    trailing: record.trailing,
                };
            }
            let Some(remaining) = deadline.remaining() else {
                call.cancel();
                return UnaryOutcome {
                    payload: None,
                    status: Status::deadline_exceeded("Deadline Exceeded"),
                    trailing: Metadata::new(),
                };
            };
            let wait = remaining.min(Duration::from_millis(50));
            let (guard, _) = call
                .outbound_ready
                .wait_timeout(outbound, wait)
                .unwrap_or_else(|e| e.into_inner());
            outbound = guard;
        }
    }

    /// Opens a server-streaming call; responses are pulled from the
    /// returned reader.
    pub fn server_stream(
        &self,
        full_method: &str,
        payload: Bytes,
        metadata: Metadata,
        deadline: Deadline,
    ) -> StreamingReader {
        if payload.len() > self.config.max_send_size {
            return StreamingReader::failed(Status::new(
                crate::status::StatusCode::ResourceExhausted,
                format!(
                    "request of {} bytes exceeds send limit of {}",
                    payload.len(),
                    self.config.max_send_size
                ),
            ));
        }
        let call = CallCore::new(self.details(metadata, deadline), Some(payload));
        deliver(&self.target, full_method, MethodKind::ServerStream, &call);
        StreamingReader {
            call,
            max_recv_size: self.config.max_recv_size,
            cancelled: false,
        }
    }

    /// Opens a client-streaming call; requests are pushed through the
    /// returned writer.
    pub fn client_stream(&self, full_method: &str, metadata: Metadata) -> StreamingWriter {
        let call = CallCore::new(self.details(metadata, Deadline::infinite()), None);
        deliver(&self.target, full_method, MethodKind::ClientStream, &call);
        StreamingWriter {
            call,
            max_send_size: self.config.max_send_size,
        }
    }
}

/// Pull side of a server-streaming call.
pub struct StreamingReader {
    call: Arc<CallCore>,
    max_recv_size: usize,
    cancelled: bool,
}

impl StreamingReader {
    fn failed(status: Status) -> Self {
        let call = CallCore::new(
            CallDetails {
                peer: String::new(),
                metadata: Metadata::new(),
                deadline: Deadline::infinite(),
            },
            None,
        );
        call.set_finish(FinishRecord {
            payload: None,
            status,
            trailing: Metadata::new(),
        });
        Self {
            call,
            max_recv_size: usize::MAX,
            cancelled: false,
        }
    }

    /// Blocks for the next response payload; `None` means end of stream.
    pub fn next(&mut self) -> Option<Bytes> {
        let mut outbound = lock(&self.call.outbound);
        loop {
            if let Some(payload) = outbound.queue.pop_front() {
                if payload.len() > self.max_recv_size {
                    drop(outbound);
                    self.cancel();
                    return None;
                }
                return Some(payload);
            }
            if outbound.finish.is_some() {
                return None;
            }
            if self.cancelled {
                return None;
            }
            let (guard, _) = self
                .call
                .outbound_ready
                .wait_timeout(outbound, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            outbound = guard;
        }
    }

    /// Cancels the call; subsequent server writes complete `ok=false`.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.call.cancel();
    }

    /// Blocks for the terminal status of the call. Returns CANCELLED when
    /// the reader cancelled locally.
    pub fn finish(&mut self) -> Status {
        if self.cancelled {
            return Status::cancelled("call was cancelled");
        }
        let mut outbound = lock(&self.call.outbound);
        loop {
            if let Some(record) = &outbound.finish {
                return record.status.clone();
            }
            let (guard, _) = self
                .call
                .outbound_ready
                .wait_timeout(outbound, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            outbound = guard;
        }
    }

    /// Trailing metadata, available once the call finished.
    pub fn trailing(&self) -> Option<Metadata> {
        lock(&self.call.outbound)
            .finish
            .as_ref()
            .map(|r| r.trailing.clone())
    }
}

/// Push side of a client-streaming call.
pub struct StreamingWriter {
    call: Arc<CallCore>,
    max_send_size: usize,
}

impl StreamingWriter {
    /// Sends one request payload. Returns `false` when the stream is
    /// broken: the server already finished, the call was cancelled, or the
    /// payload exceeds the send limit.
    pub fn write(&mut self, payload: Bytes) -> bool {
        if payload.len() > self.max_send_size || self.call.is_cancelled() {
            return false;
        }
        if lock(&self.call.outbound).finish.is_some() {
            return false;
        }
        let mut inbound = lock(&self.call.inbound);
        if inbound.closed {
            return false;
        }
        if let Some(pending) = inbound.pending_read.take() {
            *lock(&pending.dst) = Some(payload);
            pending.cq.post(pending.tag, true);
        } else {
            inbound.queue.push_back(payload);
        }
        true
    }

    /// Half-closes the request stream.
    pub fn writes_done(&mut self) {
        let mut inbound = lock(&self.call.inbound);
        inbound.closed = true;
        if let Some(pending) = inbound.pending_read.take() {
            pending.cq.post(pending.tag, false);
        }
    }

    /// Blocks for the final response and status.
    pub fn finish(self) -> (Option<Bytes>, Status) {
        let mut outbound = lock(&self.call.outbound);
        loop {
            if let Some(record) = outbound.finish.clone() {
                return (record.payload, record.status);
            }
            let (guard, _) = self
                .call
                .outbound_ready
                .wait_timeout(outbound, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            outbound = guard;
        }
    }
}
