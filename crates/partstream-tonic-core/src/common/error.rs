//! Error types for the gRPC side of partitioned streams.
//!
//! `From<Error>` for [`tonic::Status`] lets server handlers propagate errors
//! to the client with a matching status code.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the gRPC binding and the partition host.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The computation payload could not be reconstructed.
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] partstream::Error),

    /// The peer aborted the stream.
    #[error("Request cancelled by client")]
    RequestCancelled,

    /// The peer sent a malformed or out-of-order frame.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The job's time budget ran out before the exchange finished.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => Status::internal(format!("Channel error: {context}")),
            Error::Coordinator(e) => Status::invalid_argument(format!("Payload error: {e}")),
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::DeadlineExceeded => Status::deadline_exceeded("Job time budget exhausted"),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
