#![warn(missing_docs)]

//! Switchboard transport subsystem: completion-queue RPC transport
//! contract plus an in-memory provider for end-to-end exercise.

pub mod codec;
pub mod deadline;
pub mod error;
pub mod metadata;
pub mod net;
pub mod queue;
pub mod status;
pub mod uri;

pub use codec::{
    bincode_marshaller, full_method_name, DeserializeFn, Marshaller, MethodDescriptor, MethodKind,
    SerializeFn,
};
pub use deadline::Deadline;
pub use error::{Result, TransportError};
pub use metadata::Metadata;
pub use net::{
    accept_cell, read_cell, AcceptCell, CallDetails, Channel, ChannelConfig, ReadCell, ServerCall,
    ServerTransport, StreamingReader, StreamingWriter, UnaryOutcome,
};
pub use queue::{CompletionQueue, CqNext, Tag};
pub use status::{Status, StatusCode};
pub use uri::{
    format_dns_uri, format_unix_abstract_uri, format_unix_uri, is_local_peer, unescape_peer,
    Endpoint,
};
