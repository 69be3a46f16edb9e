use anyhow::bail;
use clap::Parser;

/// Largest frame a partition accepts by default (4 MiB, tonic's default
/// decoding limit).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Runtime configuration for the `partstream-server` binary.
///
/// These settings control the concurrency, buffering and shutdown behavior of
/// the partition host. All values are parsed from CLI arguments or environment
/// variables, with defaults suitable for local testing.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "partstream-server",
    version,
    about = "A gRPC partition host for partitioned stream jobs"
)]
pub struct CliArgs {
    /// Number of worker tasks processing data frames concurrently.
    ///
    /// Frames of one exchange are processed in order; frames of different
    /// exchanges are spread round-robin across workers.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Capacity of the response buffer between an exchange and its gRPC
    /// stream.
    ///
    /// Lower values increase backpressure responsiveness; higher values enable
    /// deeper pipelining.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Maximum number of data bytes accepted in a single frame.
    ///
    /// Environment variable: `MAX_FRAME_BYTES`
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Seconds to wait for in-flight exchanges to drain on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50061" or "/tmp/partstream.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50061"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_workers: usize,
    pub stream_buffer_size: usize,
    pub max_frame_bytes: usize,
    pub shutdown_timeout: u64,
    pub server_addr: String,
    pub uds: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            stream_buffer_size: 8,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            shutdown_timeout: 3,
            server_addr: String::from("0.0.0.0:50061"),
            uds: false,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.max_frame_bytes == 0 {
            bail!("MAX_FRAME_BYTES must be greater than 0");
        }

        Ok(Self {
            num_workers: args.num_workers,
            stream_buffer_size: args.stream_buffer_size,
            max_frame_bytes: args.max_frame_bytes,
            shutdown_timeout: args.shutdown_timeout,
            server_addr: args.server_addr,
            uds: args.uds,
        })
    }
}
