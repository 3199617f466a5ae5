//! Warden broker service library crate.
//!
//! # Purpose
//! Exposes the broker's subsystems (config, client listener, live-connection
//! index, liveness wiring) for use by the broker binary and integration tests.
pub mod config;
pub mod connections;
pub mod diagnostics;
pub mod listener;
pub mod protocol;
pub mod server;
