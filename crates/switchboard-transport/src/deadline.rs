//! Deadline propagation for RPC calls.
//!
//! A deadline is an absolute point in time (milliseconds since the UNIX
//! epoch) attached to a call by the client and surfaced to server handlers,
//! allowing downstream work to be skipped once it can no longer be useful.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Absolute call deadline. `u64::MAX` encodes "no deadline".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    expiry_ms: u64,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn infinite() -> Self {
        Self { expiry_ms: u64::MAX }
    }

    /// Deadline at now + `timeout`.
    pub fn after(timeout: Duration) -> Self {
        Self::from_epoch_ms(now_ms().saturating_add(timeout.as_millis() as u64))
    }

    /// Deadline at now + `timeout_ms` milliseconds. A timeout of zero means
    /// no deadline, matching the client-call convention.
    pub fn after_ms(timeout_ms: u64) -> Self {
        if timeout_ms == 0 {
            Self::infinite()
        } else {
            Self::from_epoch_ms(now_ms().saturating_add(timeout_ms))
        }
    }

    /// Deadline from milliseconds since the UNIX epoch.
    pub fn from_epoch_ms(ms: u64) -> Self {
        Self { expiry_ms: ms }
    }

    /// Returns `true` when no deadline is set.
    pub fn is_infinite(&self) -> bool {
        self.expiry_ms == u64::MAX
    }

    /// Remaining time until expiry, or `None` when already expired.
    pub fn remaining(&self) -> Option<Duration> {
        if self.is_infinite() {
            return Some(Duration::MAX);
        }
        let now = now_ms();
        if self.expiry_ms > now {
            Some(Duration::from_millis(self.expiry_ms - now))
        } else {
            None
        }
    }

    /// Returns `true` if the deadline has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// Expiry as milliseconds since the UNIX epoch.
    pub fn expiry_ms(&self) -> u64 {
        self.expiry_ms
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::infinite()
    }
}
