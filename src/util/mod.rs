//! Process plumbing shared by the library and the server binary.
//!
//! - [`b64`] - Standard base64 wrapper used by the payment header codec
//! - [`sig_down`] - Graceful shutdown signal handling
//! - [`telemetry`] - Logging and OpenTelemetry setup

pub mod b64;
pub mod sig_down;
pub mod telemetry;

pub use b64::*;
pub use sig_down::*;
pub use telemetry::*;
