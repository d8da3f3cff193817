//! Hostpipe – a command/condition protocol host for sandboxed addon scripts
//!
//! This crate implements the glue between a host application and small,
//! independently loaded content units ("addons") with:
//! - A line-oriented command channel: percent-encoded text commands in,
//!   exactly one JSON response out, strictly in request order
//! - A synchronous signal bus decoupling host state changes from the
//!   scripts observing them
//! - A condition engine evaluating per-addon boolean gates, with one
//!   named cancellable timer per condition for time-based re-evaluation
//! - A driver client for test harnesses and dev tooling, with polling
//!   helpers and a strict protocol-violation policy

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Sandboxed content units, capability surface, and the condition engine
pub mod addon;
/// Driver-side client for the command channel
pub mod driver;
/// Host-side protocol core: dispatcher, signal bus, state
pub mod host;
/// Small shared helpers
pub mod util;

// Re-export key types for convenience
pub use host::{Host, HostConfig};

/// Current version of the hostpipe crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
