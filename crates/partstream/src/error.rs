//! Error types for the partitioned stream coordinator.
//!
//! Two kinds of failure exist and they never mix:
//!
//! - [`Error`] is returned synchronously to whoever called into the
//!   coordinator (binding, payload preparation, a single send).
//! - [`ErrorCode`] is the value carried by the one completion notification a
//!   job ever produces. Synchronous errors that are fatal for the job are
//!   *also* raised through that path; partition-local failures never are.

use crate::{PartId, partition::StateError};
use core::fmt;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The final status of a job, delivered exactly once through the completion
/// notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Every used partition closed its inbound side (naturally or forced).
    None,
    /// No session was available, or the session rejected the binding.
    Setup,
    /// A send was attempted on a partition whose outbound side was closed.
    StreamSend,
    /// A regular inbound message could not be demultiplexed.
    StreamReceive,
    /// The payload attached to an inbound cancel could not be demultiplexed.
    StreamRpc,
}

impl ErrorCode {
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::None)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Setup => "setup",
            Self::StreamSend => "stream-send",
            Self::StreamReceive => "stream-receive",
            Self::StreamRpc => "stream-rpc",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a [`Session`](crate::Session) may refuse to bind a stream.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum BindError {
    /// The target business has no reachable partitions.
    #[error("target `{biz}` not found")]
    NotFound { biz: String },

    /// The target exists but every partition is degraded.
    #[error("target `{biz}` is fully degraded")]
    Degraded { biz: String },

    /// The session refused the stream for another reason.
    #[error("bind rejected: {reason}")]
    Rejected { reason: String },
}

/// Unified error type for synchronous coordinator operations.
#[derive(Clone, thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The coordinator was asked to bind without a session.
    #[error("no session available for `{biz}`")]
    NoSession { biz: String },

    /// The session refused the binding.
    #[error("bind failed: {0}")]
    Bind(#[from] BindError),

    /// A caller-specified partition lies outside the target's partition range.
    #[error("partition {part_id} out of range (part count {part_count})")]
    InvalidPartition { part_id: PartId, part_count: u32 },

    /// `pre_init` was called twice.
    #[error("stream already bound")]
    AlreadyBound,

    /// An operation that needs a transport binding ran before `pre_init`.
    #[error("stream not bound")]
    NotBound,

    /// A send ran before `post_init` produced the payload.
    #[error("payload not prepared")]
    NotPrepared,

    /// The computation descriptor is missing or serialized to nothing.
    #[error("empty computation payload")]
    EmptyPayload,

    /// Compression or decompression failed.
    #[error("codec error: {context}")]
    Codec { context: String },

    /// The referenced partition is not part of the used set.
    #[error("partition {part_id} is not used by this job")]
    UnknownPartition { part_id: PartId },

    /// A message was sent after the partition's outbound side was closed.
    #[error("send after outbound eof on partition {part_id}")]
    SendAfterEof { part_id: PartId },

    /// The transport refused the message. Absorbed as a partition-local
    /// failure.
    #[error("transport send failed on partition {part_id}")]
    Transport { part_id: PartId },

    /// A one-shot partition state transition was attempted twice.
    #[error(transparent)]
    State(#[from] StateError),
}

impl Error {
    /// Maps a synchronous error to the code it raises on the completion path.
    /// `None` for errors that stay with the caller and never end the job.
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::NoSession { .. }
            | Self::Bind(_)
            | Self::InvalidPartition { .. }
            | Self::AlreadyBound
            | Self::NotBound
            | Self::NotPrepared
            | Self::EmptyPayload
            | Self::Codec { .. } => Some(ErrorCode::Setup),
            Self::SendAfterEof { .. } | Self::State(_) => Some(ErrorCode::StreamSend),
            Self::UnknownPartition { .. } | Self::Transport { .. } => None,
        }
    }
}
