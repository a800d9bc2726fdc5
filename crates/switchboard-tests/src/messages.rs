//! Test message set and method descriptors.
//!
//! The shape generated service stubs would carry: one serde message pair
//! per method plus a descriptor constant tying names, call shape, and
//! codec together.

use serde::{Deserialize, Serialize};

use switchboard_transport::{bincode_marshaller, MethodDescriptor, MethodKind};

/// Fully-qualified name of the test service.
pub const TEST_SERVICE: &str = "test.GrpcService";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub result: bool,
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub msg: String,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub msg: String,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub result: bool,
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStreamRequest {
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStreamResponse {
    pub result: bool,
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStreamRequest {
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStreamResponse {
    pub result: bool,
    pub received: u32,
}

/// Descriptor of `test.GrpcService/Ping`.
pub fn ping_method() -> MethodDescriptor<PingRequest, PingResponse> {
    MethodDescriptor {
        service: TEST_SERVICE,
        method: "Ping",
        kind: MethodKind::Unary,
        req: bincode_marshaller(),
        resp: bincode_marshaller(),
    }
}

/// Descriptor of `test.GrpcService/Echo`.
pub fn echo_method() -> MethodDescriptor<EchoRequest, EchoResponse> {
    MethodDescriptor {
        service: TEST_SERVICE,
        method: "Echo",
        kind: MethodKind::Unary,
        req: bincode_marshaller(),
        resp: bincode_marshaller(),
    }
}

/// Descriptor of `test.GrpcService/Shutdown`.
pub fn shutdown_method() -> MethodDescriptor<ShutdownRequest, ShutdownResponse> {
    MethodDescriptor {
        service: TEST_SERVICE,
        method: "Shutdown",
        kind: MethodKind::Unary,
        req: bincode_marshaller(),
        resp: bincode_marshaller(),
    }
}

/// Descriptor of `test.GrpcService/ServerStreamTest`.
pub fn server_stream_method() -> MethodDescriptor<ServerStreamRequest, ServerStreamResponse> {
    MethodDescriptor {
        service: TEST_SERVICE,
        method: "ServerStreamTest",
        kind: MethodKind::ServerStream,
        req: bincode_marshaller(),
        resp: bincode_marshaller(),
    }
}

/// Descriptor of `test.GrpcService/ClientStreamTest`.
pub fn client_stream_method() -> MethodDescriptor<ClientStreamRequest, ClientStreamResponse> {
    MethodDescriptor {
        service: TEST_SERVICE,
        method: "ClientStreamTest",
        kind: MethodKind::ClientStream,
        req: bincode_marshaller(),
        resp: bincode_marshaller(),
    }
}
