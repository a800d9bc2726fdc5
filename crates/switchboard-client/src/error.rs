//! Client-side error types.

use thiserror::Error;

use switchboard_transport::{Status, StatusCode};

/// Errors surfaced by [`crate::ClientStub`] calls.
///
/// The rendered message for a failed call is
/// `"<op>: addressUri='<uri>', err='<status>'"`, where the status renders
/// as its message when present and its code name otherwise.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The stub has no channel; `init` was never called or `reset` was.
    #[error("invalid (null) client channel")]
    NotConnected,

    /// The call reached the transport and came back with a non-OK status.
    #[error("{op}: addressUri='{address_uri}', err='{}'", .status.describe())]
    Call {
        /// What the stub was doing, e.g. `failed to make unary call`.
        op: String,
        /// Target endpoint URI.
        address_uri: String,
        /// Transport status of the call.
        status: Status,
    },

    /// The stream broke before a status could be produced.
    #[error("{op}: addressUri='{address_uri}'")]
    Broken {
        /// What the stub was doing.
        op: String,
        /// Target endpoint URI.
        address_uri: String,
    },
}

impl ClientError {
    /// Status code associated with the failure; local failures map to
    /// UNKNOWN.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClientError::Call { status, .. } => status.code(),
            ClientError::NotConnected | ClientError::Broken { .. } => StatusCode::Unknown,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_format() {
        let err = ClientError::Call {
            op: "failed to make unary call".to_string(),
            address_uri: "dns:localhost:50051".to_string(),
            status: Status::unavailable("boom"),
        };
        assert_eq!(
            err.to_string(),
            "failed to make unary call: addressUri='dns:localhost:50051', err='UNAVAILABLE: boom'"
        );
    }

    #[test]
    fn test_call_error_without_message_uses_code() {
        let err = ClientError::Call {
            op: "failed to make unary call".to_string(),
            address_uri: "dns:h:1".to_string(),
            status: Status::new(StatusCode::Aborted, ""),
        };
        assert!(err.to_string().ends_with("err='ABORTED'"));
    }

    #[test]
    fn test_broken_error_format() {
        let err = ClientError::Broken {
            op: "failed to make client-side stream call".to_string(),
            address_uri: "unix:///tmp/s".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to make client-side stream call: addressUri='unix:///tmp/s'"
        );
    }
}
