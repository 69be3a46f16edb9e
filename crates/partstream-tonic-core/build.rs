/// Builds the gRPC client and server code for `proto/partstream.proto`.
///
/// Payload and data chunk fields are generated as `Bytes` instead of
/// `Vec<u8>`, so frames can carry the shared computation payload and
/// application chunks without copying them.
///
/// The encoded file descriptor set is written next to the generated code so
/// servers can expose it through gRPC reflection.
///
/// # Panics
///
/// Panics if code generation fails.
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("partstream_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    // Shared payloads and data chunks stay `Bytes`, not `Vec<u8>`
    config
        .bytes([
            ".partstream.InitHandshake.payload",
            ".partstream.StreamFrame.data",
        ])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/partstream.proto"], &["proto"])
        .unwrap();
}
