//! Messages exchanged with partitions.
//!
//! These are transport-agnostic. A transport maps them onto its own wire
//! frames; see `partstream-tonic-core` for the gRPC mapping.

use crate::{Codec, PartId};
use bytes::Bytes;
use core::fmt;

/// Caller-supplied parameters forwarded to every partition in the init
/// handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunParams {
    /// Identifies the caller's session on the remote side.
    pub session_id: u64,
    /// Remote log level for this job, e.g. `"debug"`. Empty means the
    /// remote default.
    pub trace_level: String,
    /// Ask the remote side to collect per-partition metrics.
    pub collect_metrics: bool,
}

/// Tracing context forwarded to partitions so their logs and spans can be
/// correlated with the caller's.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticsContext {
    pub trace_id: Option<String>,
    pub baggage: Vec<(String, String)>,
}

/// Attached to the first message sent to each partition, never resent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitHandshake {
    /// Serialized (possibly compressed) computation descriptor.
    pub payload: Bytes,
    pub codec: Codec,
    /// The partition receiving this handshake.
    pub part_id: PartId,
    pub part_count: u32,
    pub graph_id: u32,
    /// Time budget left for the job when the handshake was built.
    pub remaining_ms: Option<u64>,
    pub params: RunParams,
    pub diagnostics: DiagnosticsContext,
}

/// A message headed to one partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Random correlation id, assigned by the coordinator right before the
    /// message is handed to the transport.
    pub msg_id: u64,
    pub init: Option<InitHandshake>,
    /// Application data chunks.
    pub data: Vec<Bytes>,
}

impl OutboundMessage {
    /// A message without data; used to trigger the init handshake.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_data(data: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            data: data.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Approximate encoded size, for logs and diagnostics.
    pub fn byte_len(&self) -> usize {
        let init = self.init.as_ref().map_or(0, |init| init.payload.len());
        init + self.data.iter().map(Bytes::len).sum::<usize>()
    }
}

/// A message received from one partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub part_id: PartId,
    /// The partition will send nothing more.
    pub eof: bool,
    pub msg_id: u64,
    pub payload: Option<Bytes>,
}

impl InboundMessage {
    pub fn new(part_id: PartId, payload: impl Into<Bytes>) -> Self {
        Self {
            part_id,
            payload: Some(payload.into()),
            ..Self::default()
        }
    }

    /// A final message carrying no payload.
    pub fn eof(part_id: PartId) -> Self {
        Self {
            part_id,
            eof: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_eof(mut self) -> Self {
        self.eof = true;
        self
    }
}

/// Why the remote side (or the transport acting for it) cancelled a
/// partition's stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RemoteErrorCode {
    Cancelled,
    Timeout,
    ConnectionFailed,
    Rejected,
    Internal,
    Unknown,
}

impl RemoteErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::ConnectionFailed => "connection-failed",
            Self::Rejected => "rejected",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
