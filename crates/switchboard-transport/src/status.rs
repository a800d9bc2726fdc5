//! RPC status taxonomy shared by clients, servers, and routers.
//!
//! Codes are passed through verbatim end to end; the framework never
//! invents codes of its own.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum StatusCode {
    /// The call completed successfully.
    Ok = 0,
    /// The call was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// The caller specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the call could complete.
    DeadlineExceeded = 4,
    /// A requested entity was not found.
    NotFound = 5,
    /// An entity the caller attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the operation.
    PermissionDenied = 7,
    /// A resource (quota, capacity) has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented or supported.
    Unimplemented = 12,
    /// Internal error; an invariant expected by the system was broken.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl StatusCode {
    /// Canonical upper-snake name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// Numeric value of the code.
    pub fn value(&self) -> u32 {
        *self as u32
    }
}

impl From<u32> for StatusCode {
    fn from(value: u32) -> Self {
        match value {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code paired with an optional error message.
///
/// An OK status never carries a message; constructing one with a message
/// discards the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// Creates a status. The message is dropped when the code is OK.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        let message = if code == StatusCode::Ok {
            String::new()
        } else {
            message.into()
        };
        Self { code, message }
    }

    /// The OK status.
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    /// Shorthand for a CANCELLED status.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    /// Shorthand for an INTERNAL status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// Shorthand for an UNAVAILABLE status.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    /// Shorthand for a DEADLINE_EXCEEDED status.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    /// Shorthand for an UNIMPLEMENTED status.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    /// The status code.
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// The error message; empty for OK statuses.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if the code is OK.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Human-readable rendering: `CODE: message`, or just the code name
    /// when there is no message.
    pub fn describe(&self) -> String {
        if self.message.is_empty() {
            self.code.as_str().to_string()
        } else {
            format!("{}: {}", self.code.as_str(), self.message)
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for value in 0u32..=16 {
            let code = StatusCode::from(value);
            assert_eq!(code.value(), value);
        }
    }

    #[test]
    fn test_unknown_value_maps_to_unknown() {
        assert_eq!(StatusCode::from(99), StatusCode::Unknown);
        assert_eq!(StatusCode::from(2), StatusCode::Unknown);
    }

    #[test]
    fn test_ok_discards_message() {
        let status = Status::new(StatusCode::Ok, "ignored");
        assert!(status.is_ok());
        assert!(status.message().is_empty());
        assert_eq!(status.describe(), "OK");
    }

    #[test]
    fn test_describe_includes_code_and_message() {
        let status = Status::unavailable("boom");
        assert_eq!(status.describe(), "UNAVAILABLE: boom");
        assert_eq!(status.to_string(), "UNAVAILABLE: boom");
    }

    #[test]
    fn test_describe_code_only() {
        let status = Status::new(StatusCode::Aborted, "");
        assert_eq!(status.describe(), "ABORTED");
    }

    #[test]
    fn test_code_names() {
        assert_eq!(StatusCode::DeadlineExceeded.as_str(), "DEADLINE_EXCEEDED");
        assert_eq!(StatusCode::Unauthenticated.as_str(), "UNAUTHENTICATED");
        assert_eq!(StatusCode::DataLoss.as_str(), "DATA_LOSS");
    }
}
