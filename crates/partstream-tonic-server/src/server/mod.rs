//! Server-side components of the partition host.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration.
//! - [`pool`] - Worker pool orchestration and exchange accounting.
//! - [`service`] - The `PartitionStream` gRPC service.
//! - [`streaming`] - Handshake validation and per-exchange frame handling.
//! - [`telemetry`] - Logging and optional OpenTelemetry export.

pub mod config;
pub mod pool;
pub mod service;
pub mod streaming;
pub mod telemetry;
