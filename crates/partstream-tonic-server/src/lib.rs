#![doc = include_str!("../README.md")]

pub mod server;

pub use server::{
    config::{CliArgs, ServerConfig},
    service::handler::PartitionService,
};

use partstream_tonic_core::proto::partition_stream_server::PartitionStreamServer;
use tonic::codec::CompressionEncoding;

/// Wraps `service` in the generated gRPC server, accepting and sending every
/// supported compression.
pub fn build_partition_service(service: PartitionService) -> PartitionStreamServer<PartitionService> {
    PartitionStreamServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}
