//! Transport error types for the Switchboard RPC layer.

use thiserror::Error;

/// Transport-specific errors that can occur while binding endpoints,
/// arming calls, or moving messages.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No listener is bound to the requested endpoint.
    #[error("endpoint '{uri}' is not reachable")]
    EndpointUnavailable {
        /// Endpoint URI that could not be resolved.
        uri: String,
    },

    /// Another listener already owns the endpoint.
    #[error("endpoint '{uri}' is already bound")]
    EndpointInUse {
        /// Endpoint URI that is already taken.
        uri: String,
    },

    /// The endpoint URI does not match any supported scheme.
    #[error("invalid address uri '{uri}': {reason}")]
    InvalidUri {
        /// The rejected URI.
        uri: String,
        /// Why the URI was rejected.
        reason: String,
    },

    /// Metadata keys must be non-empty printable ASCII.
    #[error("invalid metadata key '{key}'")]
    InvalidMetadataKey {
        /// The rejected key.
        key: String,
    },

    /// Message (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A payload exceeded the channel's configured size limit.
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Size of the offending payload in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// An operation was issued against a completion queue that is shut down.
    #[error("completion queue is shut down")]
    QueueShutdown,
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
