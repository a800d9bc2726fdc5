//! Switchboard test and validation infrastructure.
//!
//! Scenario services, a threaded server harness, and the end-to-end
//! suites covering the framework's reference behaviours: unary and
//! streaming calls, shutdown policy, slot re-arming, and router
//! forwarding with both bridge modes.

pub mod harness;
pub mod messages;
pub mod services;

#[cfg(test)]
mod client_tests;
#[cfg(test)]
mod lifecycle_tests;
#[cfg(test)]
mod server_tests;

pub use harness::{start_server, start_server_with, unique_uri, wait_until, RunningServer};
pub use services::{DownstreamBehavior, DownstreamService, RouterService, TestService};
