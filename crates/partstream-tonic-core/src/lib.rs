#![doc = include_str!("../README.md")]

mod common;
mod transport;

pub use common::*;
pub use transport::*;
// Public re-export so downstream crates can reach the coordinator via
// `partstream_tonic_core::partstream`
pub use partstream;

/// gRPC service and message definitions generated from
/// `proto/partstream.proto`.
///
/// ## Service
///
/// - `Exchange` - One bidirectional stream of [`StreamFrame`]s per partition.
///
/// ## Frames
///
/// The first client frame on each stream carries an [`InitHandshake`] with the
/// serialized computation. Later frames carry `data` chunks only. A frame with
/// `eof` set closes the sender's side; cancellation is a gRPC status.
///
/// [`StreamFrame`]: proto::StreamFrame
/// [`InitHandshake`]: proto::InitHandshake
pub mod proto {
    tonic::include_proto!("partstream");

    /// Encoded descriptor set for gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("partstream_descriptor");
}
