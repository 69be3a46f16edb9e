//! Mapping between coordinator messages and wire frames.

use crate::{Error, Result, proto};
use bytes::{Bytes, BytesMut};
use partstream::{
    Codec, DiagnosticsContext, InboundMessage, InitHandshake, OutboundMessage, PartId,
    RemoteErrorCode, RunParams, SubgraphDef,
};
use prost::Message as _;
use tonic::Code;

/// Wire frame for `message` on partition `part_id`.
pub fn outbound_frame(part_id: PartId, eof: bool, message: OutboundMessage) -> proto::StreamFrame {
    proto::StreamFrame {
        part_id,
        msg_id: message.msg_id,
        eof,
        init: message.init.map(proto::InitHandshake::from),
        data: message.data,
    }
}

/// Coordinator view of a frame received on partition `part_id`.
///
/// Multiple data chunks are joined into one payload; a frame without data
/// carries no payload.
pub fn inbound_message(part_id: PartId, frame: proto::StreamFrame) -> InboundMessage {
    InboundMessage {
        part_id,
        eof: frame.eof,
        msg_id: frame.msg_id,
        payload: join_chunks(frame.data),
    }
}

fn join_chunks(mut chunks: Vec<Bytes>) -> Option<Bytes> {
    match chunks.len() {
        0 => None,
        1 => chunks.pop(),
        _ => {
            let mut joined = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in &chunks {
                joined.extend_from_slice(chunk);
            }
            Some(joined.freeze())
        }
    }
}

impl From<InitHandshake> for proto::InitHandshake {
    fn from(init: InitHandshake) -> Self {
        Self {
            payload: init.payload,
            codec: init.codec.tag(),
            part_id: init.part_id,
            part_count: init.part_count,
            graph_id: init.graph_id,
            remaining_ms: init.remaining_ms,
            params: Some(proto::RunParams {
                session_id: init.params.session_id,
                trace_level: init.params.trace_level,
                collect_metrics: init.params.collect_metrics,
            }),
            trace_id: init.diagnostics.trace_id,
            baggage: init
                .diagnostics
                .baggage
                .into_iter()
                .map(|(key, value)| proto::Baggage { key, value })
                .collect(),
        }
    }
}

impl TryFrom<proto::InitHandshake> for InitHandshake {
    type Error = Error;

    fn try_from(init: proto::InitHandshake) -> Result<Self> {
        let codec = Codec::from_tag(init.codec).ok_or_else(|| Error::InvalidRequest {
            reason: format!("unknown payload codec {}", init.codec),
        })?;
        if init.part_id >= init.part_count {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "partition {} out of range (part count {})",
                    init.part_id, init.part_count
                ),
            });
        }
        let params = init.params.unwrap_or_default();
        Ok(Self {
            payload: init.payload,
            codec,
            part_id: init.part_id,
            part_count: init.part_count,
            graph_id: init.graph_id,
            remaining_ms: init.remaining_ms,
            params: RunParams {
                session_id: params.session_id,
                trace_level: params.trace_level,
                collect_metrics: params.collect_metrics,
            },
            diagnostics: DiagnosticsContext {
                trace_id: init.trace_id,
                baggage: init
                    .baggage
                    .into_iter()
                    .map(|baggage| (baggage.key, baggage.value))
                    .collect(),
            },
        })
    }
}

/// Reconstructs the computation descriptor carried by a handshake.
///
/// # Errors
///
/// Returns [`Error::Coordinator`] if the payload does not decompress, or
/// [`Error::InvalidRequest`] if it is not a descriptor or disagrees with the
/// handshake's graph id.
pub fn decode_subgraph(init: &InitHandshake) -> Result<SubgraphDef> {
    let raw = init.codec.decompress(&init.payload)?;
    let subgraph = SubgraphDef::decode(raw.as_slice()).map_err(|e| Error::InvalidRequest {
        reason: format!("malformed computation payload: {e}"),
    })?;
    if subgraph.graph_id != init.graph_id {
        return Err(Error::InvalidRequest {
            reason: format!(
                "graph id mismatch: handshake {}, payload {}",
                init.graph_id, subgraph.graph_id
            ),
        });
    }
    Ok(subgraph)
}

/// The coordinator-level reason for a stream that ended with `code`.
pub const fn remote_error_code(code: Code) -> RemoteErrorCode {
    match code {
        Code::Cancelled => RemoteErrorCode::Cancelled,
        Code::DeadlineExceeded => RemoteErrorCode::Timeout,
        Code::Unavailable => RemoteErrorCode::ConnectionFailed,
        Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::PermissionDenied
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::OutOfRange
        | Code::Unimplemented
        | Code::Unauthenticated => RemoteErrorCode::Rejected,
        Code::Aborted | Code::Internal | Code::DataLoss => RemoteErrorCode::Internal,
        Code::Ok | Code::Unknown => RemoteErrorCode::Unknown,
    }
}
