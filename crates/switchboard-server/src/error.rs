//! Server-side error types.

use thiserror::Error;

use switchboard_transport::{StatusCode, TransportError};

/// Errors raised while assembling or running a server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A service with the same fully-qualified name is already registered.
    #[error("service '{name}' is already registered")]
    DuplicateService {
        /// The conflicting service name.
        name: String,
    },

    /// The service's `on_init` hook returned false.
    #[error("initialization failed for service '{name}'")]
    ServiceInit {
        /// Name of the failing service.
        name: String,
    },

    /// A binding was attempted for a method of a different service.
    #[error("method '{method}' does not belong to service '{service}'")]
    ForeignMethod {
        /// The method's fully-qualified name.
        method: String,
        /// The service the binder belongs to.
        service: String,
    },

    /// A method was bound twice.
    #[error("method '{name}' is already bound")]
    DuplicateMethod {
        /// The conflicting method name.
        name: String,
    },

    /// The application's `on_init` hook rejected startup.
    #[error("server initialization failed: {0}")]
    Init(String),

    /// `run` was called with no registered services.
    #[error("server initialization failed: no services registered")]
    NoServices,

    /// `run` was called with services but no method bindings.
    #[error("server initialization failed: no RPC bindings registered")]
    NoBindings,

    /// A transport-level failure (endpoint binding, URIs).
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ServerError {
    /// Status code a caller-facing surface would report for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::DuplicateService { .. }
            | ServerError::ForeignMethod { .. }
            | ServerError::DuplicateMethod { .. } => StatusCode::InvalidArgument,
            ServerError::Transport(TransportError::EndpointUnavailable { .. }) => {
                StatusCode::Unavailable
            }
            _ => StatusCode::Internal,
        }
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
