//! Typed blocking client stub.
//!
//! One stub wraps one channel to one endpoint. Calls are typed through
//! [`MethodDescriptor`]s, the way generated service stubs would drive
//! them. After a transport failure the caller is expected to `reset` the
//! stub so the next call rebuilds the channel instead of reusing a dead
//! one.

use std::sync::RwLock;

use tracing::debug;

use switchboard_transport::{
    Channel, ChannelConfig, Deadline, DeserializeFn, Metadata, MethodDescriptor, Status,
    StreamingReader,
};

use crate::error::{ClientError, Result};

#[derive(Default)]
struct StubInner {
    channel: Option<Channel>,
    address_uri: String,
}

/// Blocking RPC client for one endpoint.
pub struct ClientStub {
    inner: RwLock<StubInner>,
}

impl Default for ClientStub {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStub {
    /// Creates an unconnected stub; call [`ClientStub::init`] before use.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StubInner::default()),
        }
    }

    /// Creates a stub already aimed at `address_uri`.
    pub fn connected(address_uri: &str) -> Self {
        let stub = Self::new();
        stub.init(address_uri);
        stub
    }

    /// (Re)creates the channel aimed at `address_uri` with default
    /// channel configuration (unlimited message sizes).
    pub fn init(&self, address_uri: &str) {
        self.init_with(address_uri, ChannelConfig::default());
    }

    /// (Re)creates the channel with explicit configuration.
    pub fn init_with(&self, address_uri: &str, config: ChannelConfig) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.channel = Some(Channel::connect_with(address_uri, config));
        inner.address_uri = address_uri.to_string();
    }

    /// Releases the channel and returns the stub to its initial state.
    /// Used after transport failures so a dead channel is never reused,
    /// and around `fork`.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.channel.is_some() {
            debug!(address_uri = %inner.address_uri, "resetting client channel");
        }
        inner.channel = None;
        inner.address_uri.clear();
    }

    /// Whether the stub currently holds a channel.
    pub fn is_valid(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .channel
            .is_some()
    }

    /// Endpoint URI of the current channel, if any.
    pub fn address_uri(&self) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .channel
            .as_ref()
            .map(|_| inner.address_uri.clone())
    }

    fn channel(&self) -> Result<(Channel, String)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match &inner.channel {
            Some(channel) => Ok((channel.clone(), inner.address_uri.clone())),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Issues a unary call with the given metadata and timeout. A timeout
    /// of zero means no deadline.
    pub fn call<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        req: &Req,
        metadata: &Metadata,
        timeout_ms: u64,
    ) -> Result<Resp> {
        let (channel, address_uri) = self.channel()?;
        let payload = (method.req.ser)(req).map_err(|e| ClientError::Call {
            op: "failed to encode unary request".to_string(),
            address_uri: address_uri.clone(),
            status: Status::internal(e.to_string()),
        })?;
        let outcome = channel.unary(
            &method.full_name(),
            payload,
            metadata.clone(),
            Deadline::after_ms(timeout_ms),
        );
        if !outcome.status.is_ok() {
            return Err(ClientError::Call {
                op: "failed to make unary call".to_string(),
                address_uri,
                status: outcome.status,
            });
        }
        let payload = outcome.payload.unwrap_or_default();
        (method.resp.de)(&payload).map_err(|e| ClientError::Call {
            op: "failed to decode unary response".to_string(),
            address_uri,
            status: Status::internal(e.to_string()),
        })
    }

    /// Issues a server-streaming call, invoking `on_resp` for every
    /// response. When `on_resp` returns `false` the stream is cancelled
    /// and drained. Returns Ok iff the transport finished with OK.
    pub fn call_stream<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        req: &Req,
        mut on_resp: impl FnMut(Resp) -> bool,
        metadata: &Metadata,
    ) -> Result<()> {
        let (channel, address_uri) = self.channel()?;
        let payload = (method.req.ser)(req).map_err(|e| ClientError::Call {
            op: "failed to encode stream request".to_string(),
            address_uri: address_uri.clone(),
            status: Status::internal(e.to_string()),
        })?;
        let mut reader = channel.server_stream(
            &method.full_name(),
            payload,
            metadata.clone(),
            Deadline::infinite(),
        );
        while let Some(bytes) = reader.next() {
            let resp = match (method.resp.de)(&bytes) {
                Ok(resp) => resp,
                Err(e) => {
                    reader.cancel();
                    while reader.next().is_some() {}
                    return Err(ClientError::Call {
                        op: "failed to decode stream response".to_string(),
                        address_uri,
                        status: Status::internal(e.to_string()),
                    });
                }
            };
            if !on_resp(resp) {
                reader.cancel();
                while reader.next().is_some() {}
                break;
            }
        }
        let status = reader.finish();
        if status.is_ok() {
            Ok(())
        } else {
            Err(ClientError::Call {
                op: "failed to make server-side stream call".to_string(),
                address_uri,
                status,
            })
        }
    }

    /// Opens a server-streaming call and returns a pull-model handle,
    /// leaving pacing and cancellation to the caller.
    pub fn open_stream<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        req: &Req,
        metadata: &Metadata,
    ) -> Result<StreamingCall<Resp>> {
        let (channel, address_uri) = self.channel()?;
        let payload = (method.req.ser)(req).map_err(|e| ClientError::Call {
            op: "failed to encode stream request".to_string(),
            address_uri: address_uri.clone(),
            status: Status::internal(e.to_string()),
        })?;
        let reader = channel.server_stream(
            &method.full_name(),
            payload,
            metadata.clone(),
            Deadline::infinite(),
        );
        Ok(StreamingCall {
            reader,
            de: method.resp.de,
            address_uri,
        })
    }

    /// Issues a client-streaming call. `produce` is invoked repeatedly for
    /// the next request; `None` half-closes the stream, after which the
    /// single response is read back.
    pub fn call_client_stream<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        mut produce: impl FnMut() -> Option<Req>,
        metadata: &Metadata,
    ) -> Result<Resp> {
        let (channel, address_uri) = self.channel()?;
        let mut writer = channel.client_stream(&method.full_name(), metadata.clone());
        while let Some(req) = produce() {
            let payload = (method.req.ser)(&req).map_err(|e| ClientError::Call {
                op: "failed to encode stream request".to_string(),
                address_uri: address_uri.clone(),
                status: Status::internal(e.to_string()),
            })?;
            if !writer.write(payload) {
                return Err(ClientError::Broken {
                    op: "failed to make client-side stream call".to_string(),
                    address_uri,
                });
            }
        }
        writer.writes_done();
        let (payload, status) = writer.finish();
        if !status.is_ok() {
            return Err(ClientError::Call {
                op: "failed to make client-side stream call".to_string(),
                address_uri,
                status,
            });
        }
        let payload = payload.unwrap_or_default();
        (method.resp.de)(&payload).map_err(|e| ClientError::Call {
            op: "failed to decode stream response".to_string(),
            address_uri,
            status: Status::internal(e.to_string()),
        })
    }
}

/// Pull-model handle to an open server stream.
pub struct StreamingCall<Resp> {
    reader: StreamingReader,
    de: DeserializeFn<Resp>,
    address_uri: String,
}

impl<Resp> StreamingCall<Resp> {
    /// Blocks for the next response; `None` means end of stream.
    pub fn next(&mut self) -> Option<Result<Resp>> {
        let bytes = self.reader.next()?;
        Some((self.de)(&bytes).map_err(|e| ClientError::Call {
            op: "failed to decode stream response".to_string(),
            address_uri: self.address_uri.clone(),
            status: Status::internal(e.to_string()),
        }))
    }

    /// Cancels the stream; the server observes failed writes.
    pub fn cancel(&mut self) {
        self.reader.cancel();
    }

    /// Drains any buffered responses without decoding them.
    pub fn drain(&mut self) {
        while self.reader.next().is_some() {}
    }

    /// Blocks for the terminal status of the call.
    pub fn finish(&mut self) -> Status {
        self.reader.finish()
    }
}
