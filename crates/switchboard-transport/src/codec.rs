//! Message codec seam and typed method descriptors.
//!
//! The framework core never interprets payload bytes; every method carries
//! a pair of (de)serialization function pointers. Function pointers keep
//! descriptors `Copy` and avoid trait objects on the per-message path. The
//! default codec is bincode over serde.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TransportError};

/// Serializes a message to wire bytes.
pub type SerializeFn<T> = fn(&T) -> Result<Bytes>;

/// Deserializes a message from wire bytes.
pub type DeserializeFn<T> = fn(&[u8]) -> Result<T>;

/// How to move one message type across the wire.
pub struct Marshaller<T> {
    /// The serialize function.
    pub ser: SerializeFn<T>,
    /// The deserialize function.
    pub de: DeserializeFn<T>,
}

impl<T> Clone for Marshaller<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Marshaller<T> {}

fn bincode_ser<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| TransportError::Codec(e.to_string()))
}

fn bincode_de<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| TransportError::Codec(e.to_string()))
}

/// The default marshaller: bincode over serde.
pub fn bincode_marshaller<T: Serialize + DeserializeOwned>() -> Marshaller<T> {
    Marshaller {
        ser: bincode_ser::<T>,
        de: bincode_de::<T>,
    }
}

/// Shape of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStream,
    /// A stream of requests, one response.
    ClientStream,
}

/// A typed method descriptor: the shape generated service stubs would carry.
pub struct MethodDescriptor<Req, Resp> {
    /// Fully-qualified service name, e.g. `test.GrpcService`.
    pub service: &'static str,
    /// Bare method name, e.g. `Ping`.
    pub method: &'static str,
    /// Call shape.
    pub kind: MethodKind,
    /// Request marshaller.
    pub req: Marshaller<Req>,
    /// Response marshaller.
    pub resp: Marshaller<Resp>,
}

impl<Req, Resp> MethodDescriptor<Req, Resp> {
    /// `service/Method`, the key used on the wire and in accept tables.
    pub fn full_name(&self) -> String {
        full_method_name(self.service, self.method)
    }
}

impl<Req, Resp> Clone for MethodDescriptor<Req, Resp> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp> Copy for MethodDescriptor<Req, Resp> {}

/// Joins a service and method name into the wire-level method key.
pub fn full_method_name(service: &str, method: &str) -> String {
    format!("{service}/{method}")
}
