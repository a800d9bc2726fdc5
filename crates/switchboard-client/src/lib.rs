#![warn(missing_docs)]

//! Switchboard client: typed blocking stub over the completion-queue
//! transport, plus fork support for POSIX callers.

pub mod error;
mod fork;
pub mod stub;

pub use error::{ClientError, Result};
#[cfg(unix)]
pub use fork::{fork_with_stub, ForkOutcome};
pub use stub::{ClientStub, StreamingCall};
