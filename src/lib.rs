//! Lightweight service supervisor daemon for Unix hosts.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
use humantime as _;
// OpenSSL is only needed for static linking on Linux
#[cfg(target_os = "linux")]
use openssl_sys as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// Health-check scheduling and probes.
pub mod checks;

/// CLI parsing.
pub mod cli;

/// Constants.
pub mod constants;

/// Daemon wiring and control loop.
pub mod daemon;

/// Ensure loop and manager registry.
pub mod engine;

/// Errors.
pub mod error;

/// IPC with the daemon control socket.
pub mod ipc;

/// Log formatting, forwarding and streaming.
pub mod logs;

/// Layered plan model.
pub mod plan;

/// Subreaper and child exit dispatch.
pub mod reaper;

/// Pending system restart tracking.
pub mod restart;

/// Per-service byte ring buffers.
pub mod ringbuf;

/// Runtime paths and modes.
pub mod runtime;

/// Service lifecycle engine.
pub mod service;

/// Child process spawning.
pub mod spawn;

/// Task, change and warning state.
pub mod state;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
