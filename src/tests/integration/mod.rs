//! Diameter node integration tests
//!
//! Every test runs real nodes against each other (or against a hand-driven
//! raw connection) over loopback TCP, on ports chosen by the OS.
//!
//! ## Test Categories
//!
//! - `exchange`: request/answer correlation and inbound routing
//! - `dispatch`: pooled dispatch backpressure
//! - `lifecycle`: reconnect, watchdog, capabilities rejection, shutdown

pub mod common;
pub mod dispatch;
pub mod exchange;
pub mod lifecycle;

pub use common::*;
