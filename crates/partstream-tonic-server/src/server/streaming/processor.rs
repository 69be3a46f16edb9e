use bytes::Bytes;
use partstream_tonic_core::{partstream::PartId, proto::StreamFrame};
use tokio::sync::mpsc;
use tonic::Status;

/// Handles the data of one inbound frame within a worker.
///
/// The host echoes: the frame's non-empty chunks are sent back in a single
/// frame under the same message id. A frame without data produces nothing. If
/// the exchange is gone the work is skipped.
#[allow(clippy::used_underscore_binding)]
pub async fn handle_frame_request(
    _worker_id: usize,
    part_id: PartId,
    msg_id: u64,
    data: Vec<Bytes>,
    tx: mpsc::Sender<Result<StreamFrame, Status>>,
) {
    let data: Vec<Bytes> = data.into_iter().filter(|chunk| !chunk.is_empty()).collect();
    if data.is_empty() {
        return;
    }

    if tx.is_closed() {
        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {_worker_id} dropping frame {msg_id} of closed exchange");
        return;
    }

    let frame = StreamFrame {
        part_id,
        msg_id,
        eof: false,
        init: None,
        data,
    };
    if let Err(_e) = tx.send(Ok(frame)).await {
        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {_worker_id} failed to send frame: {_e}");
    }
}
