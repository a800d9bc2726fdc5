//! Per-call contexts handed to service handlers.
//!
//! A unary handler sees an [`RpcContext`]; streaming handlers see the
//! stream variants, which add the has-more protocol and a per-call slot
//! for state carried across handler re-entries. Handlers communicate
//! failure exclusively through [`RpcContext::set_status`]; they never
//! return errors.

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tracing::warn;

use switchboard_transport::{
    unescape_peer, CallDetails, Deadline, Metadata, Status, StatusCode,
};

/// Opaque per-binding configuration passed through to every call.
pub type BindingParam = Arc<dyn Any + Send + Sync>;

/// Per-call user state owned by the handler across re-entries.
pub type UserSlot = Box<dyn Any + Send>;

/// Context for one RPC, exposed to handlers.
pub struct RpcContext {
    peer: String,
    client_metadata: Metadata,
    deadline: Deadline,
    trailing: Metadata,
    status: Status,
    finished: bool,
    binding_param: Option<BindingParam>,
}

impl RpcContext {
    pub(crate) fn new(details: &CallDetails, binding_param: Option<BindingParam>) -> Self {
        Self {
            peer: unescape_peer(&details.peer),
            client_metadata: details.metadata.clone(),
            deadline: details.deadline,
            trailing: Metadata::new(),
            status: Status::ok(),
            finished: false,
            binding_param,
        }
    }

    /// Peer string of the caller, with IPv6 brackets un-escaped.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read-only client metadata sent with the call.
    pub fn client_metadata(&self) -> &Metadata {
        &self.client_metadata
    }

    /// First client-metadata value for `key`, as UTF-8.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.client_metadata.get_str(key)
    }

    /// Appends a trailing-metadata pair delivered with the final status.
    /// Invalid keys are dropped with a warning.
    pub fn add_trailing_metadata(&mut self, key: &str, value: &str) {
        if let Err(e) = self.trailing.append_str(key, value) {
            warn!(key, error = %e, "dropping invalid trailing metadata");
        }
    }

    /// Sets the call status. An OK code clears any error text; calls after
    /// the RPC already finished are ignored.
    pub fn set_status(&mut self, code: StatusCode, message: impl Into<String>) {
        if self.finished {
            return;
        }
        self.status = Status::new(code, message);
    }

    /// Current call status.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Current error text; empty while the status is OK.
    pub fn error(&self) -> &str {
        self.status.message()
    }

    /// Deadline attached to the call by the client.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Per-binding configuration supplied at bind time, if any.
    pub fn binding_param<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.binding_param
            .as_deref()
            .and_then(|p| p.downcast_ref::<T>())
    }

    pub(crate) fn trailing_metadata(&self) -> &Metadata {
        &self.trailing
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }
}

/// Terminal disposition of a server stream, written by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// The stream is still producing responses.
    Streaming,
    /// The stream finished and the final status was delivered.
    Success,
    /// A transport operation on the stream failed.
    Error,
}

/// Context for a server-streaming RPC.
///
/// The handler is re-entered once per response: it fills the response and
/// sets `has_more` to request another entry, or clears it to finish the
/// stream. After the terminal transport event the handler is entered one
/// last time with a terminal [`StreamStatus`] to release the user slot.
pub struct ServerStreamContext {
    base: RpcContext,
    stream_status: StreamStatus,
    has_more: bool,
    slot: Option<UserSlot>,
}

impl ServerStreamContext {
    pub(crate) fn new(details: &CallDetails, binding_param: Option<BindingParam>) -> Self {
        Self {
            base: RpcContext::new(details, binding_param),
            stream_status: StreamStatus::Streaming,
            has_more: false,
            slot: None,
        }
    }

    /// Tells the framework whether another response will follow.
    pub fn set_has_more(&mut self, has_more: bool) {
        self.has_more = has_more;
    }

    /// Whether the handler asked for another response write.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Stream disposition; terminal values mean this is the cleanup entry.
    pub fn stream_status(&self) -> StreamStatus {
        self.stream_status
    }

    pub(crate) fn set_stream_status(&mut self, status: StreamStatus) {
        self.stream_status = status;
    }

    /// Stores per-call state carried across handler re-entries.
    pub fn set_param(&mut self, slot: UserSlot) {
        self.slot = Some(slot);
    }

    /// Takes the per-call state out of the context.
    pub fn take_param(&mut self) -> Option<UserSlot> {
        self.slot.take()
    }

    /// Borrows the per-call state, downcast to `T`.
    pub fn param_ref<T: Any>(&self) -> Option<&T> {
        self.slot.as_deref().and_then(|s| s.downcast_ref::<T>())
    }

    /// Mutably borrows the per-call state, downcast to `T`.
    pub fn param_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.slot.as_deref_mut().and_then(|s| s.downcast_mut::<T>())
    }
}

impl Deref for ServerStreamContext {
    type Target = RpcContext;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl DerefMut for ServerStreamContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

/// Context for a client-streaming RPC.
///
/// The handler is entered once per received request while `has_more` is
/// true, then one final time with `has_more` false to produce the single
/// response.
pub struct ClientStreamContext {
    base: RpcContext,
    has_more: bool,
    slot: Option<UserSlot>,
}

impl ClientStreamContext {
    pub(crate) fn new(details: &CallDetails, binding_param: Option<BindingParam>) -> Self {
        Self {
            base: RpcContext::new(details, binding_param),
            has_more: true,
            slot: None,
        }
    }

    /// True while more client requests are expected; false once the client
    /// half-closed.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub(crate) fn set_has_more(&mut self, has_more: bool) {
        self.has_more = has_more;
    }

    /// Stores per-call state carried across handler re-entries.
    pub fn set_param(&mut self, slot: UserSlot) {
        self.slot = Some(slot);
    }

    /// Takes the per-call state out of the context.
    pub fn take_param(&mut self) -> Option<UserSlot> {
        self.slot.take()
    }

    /// Borrows the per-call state, downcast to `T`.
    pub fn param_ref<T: Any>(&self) -> Option<&T> {
        self.slot.as_deref().and_then(|s| s.downcast_ref::<T>())
    }

    /// Mutably borrows the per-call state, downcast to `T`.
    pub fn param_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.slot.as_deref_mut().and_then(|s| s.downcast_mut::<T>())
    }
}

impl Deref for ClientStreamContext {
    type Target = RpcContext;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl DerefMut for ClientStreamContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}
