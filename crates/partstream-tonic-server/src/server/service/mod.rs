//! gRPC service implementation.
//!
//! - [`handler`] - gRPC service entry point ([`handler::PartitionService`]).

pub mod handler;
