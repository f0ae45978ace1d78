//! Pipeline Integration Tests
//!
//! End-to-end runs of the manager against a simulated server group:
//! commits, acknowledgments, reconnects with resend, rejoin, shutdown drain.

#[path = "../common/mod.rs"]
mod common;

mod lifecycle;
mod soak;
