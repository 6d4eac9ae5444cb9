//! Process plumbing for the `admin-nonce` binary.
//!
//! - [`sig_down`] - Graceful shutdown on SIGTERM/SIGINT
//! - [`telemetry`] - Tracing subscriber and OpenTelemetry export

pub mod sig_down;
pub mod telemetry;

pub use sig_down::*;
pub use telemetry::*;
