//! Fork support for processes holding a client stub.
//!
//! The supported sequence is: reset the stub before `fork()`, re-init it
//! in the parent afterwards. The child starts with an unconnected stub
//! and rebuilds its own channel lazily.

#![cfg(unix)]

use std::io;

use crate::stub::ClientStub;

/// Which side of the fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Parent process; carries the child's pid.
    Parent(libc::pid_t),
    /// Child process.
    Child,
}

/// Forks the process with the stub's channel torn down across the
/// boundary. The parent's stub is re-initialized to its previous target;
/// the child's stub is left unconnected.
pub fn fork_with_stub(stub: &ClientStub) -> io::Result<ForkOutcome> {
    let address_uri = stub.address_uri();
    stub.reset();

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        // Fork failed; restore the parent's channel before reporting.
        if let Some(uri) = &address_uri {
            stub.init(uri);
        }
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        return Ok(ForkOutcome::Child);
    }
    if let Some(uri) = &address_uri {
        stub.init(uri);
    }
    Ok(ForkOutcome::Parent(pid))
}
