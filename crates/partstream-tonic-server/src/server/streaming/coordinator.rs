use super::request::WorkRequest;
use crate::server::{config::ServerConfig, pool::manager::WorkerPool};
use bytes::Bytes;
use partstream_tonic_core::{Error, partstream::PartId, proto::StreamFrame};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

/// Feeds the frames of one exchange through the worker pool, in order.
///
/// `first` is the frame that carried the (already validated) handshake; it may
/// also carry data. Each frame with data is dispatched to the next worker and
/// its results are forwarded to `resp_tx` before the next frame is read, so
/// responses keep the order of the requests. Once the client closes its side
/// (an `eof` frame or the end of the request stream), a final `eof` frame is
/// sent back.
///
/// Errors are surfaced to the client when it is still listening, then
/// returned. Returns the number of frames read from the client.
pub async fn feed_frames<S>(
    first: StreamFrame,
    inbound: S,
    part_id: PartId,
    worker_pool: Arc<WorkerPool>,
    resp_tx: mpsc::Sender<Result<StreamFrame, Status>>,
    config: ServerConfig,
) -> partstream_tonic_core::Result<u64>
where
    S: Stream<Item = Result<StreamFrame, Status>> + Unpin,
{
    let result = pump(first, inbound, part_id, &worker_pool, &resp_tx, &config).await;
    if let Err(e) = &result {
        // A cancelled client is no longer listening.
        if !matches!(e, Error::RequestCancelled) {
            if let Err(_e) = resp_tx.send(Err(e.clone().into())).await {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to forward err: {}", _e);
            }
        }
    }
    result
}

async fn pump<S>(
    first: StreamFrame,
    mut inbound: S,
    part_id: PartId,
    worker_pool: &WorkerPool,
    resp_tx: &mpsc::Sender<Result<StreamFrame, Status>>,
    config: &ServerConfig,
) -> partstream_tonic_core::Result<u64>
where
    S: Stream<Item = Result<StreamFrame, Status>> + Unpin,
{
    let shutdown = worker_pool.shutdown_token();
    let mut frame = first;
    let mut frames = 1;

    loop {
        validate(&frame, part_id, config)?;
        let eof = frame.eof;
        if frame.data.iter().any(|chunk| !chunk.is_empty()) {
            dispatch(worker_pool, resp_tx, part_id, frame.msg_id, frame.data).await?;
        }
        if eof {
            break;
        }

        let next = tokio::select! {
            () = shutdown.cancelled() => return Err(Error::ServiceShutdown),
            next = inbound.next() => next,
        };
        frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(_status)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(part_id, "Client stream failed: {}", _status.message());
                return Err(Error::RequestCancelled);
            }
            // Half-close without an eof frame ends the input all the same.
            None => break,
        };
        frames += 1;
    }

    let last = StreamFrame {
        part_id,
        eof: true,
        ..StreamFrame::default()
    };
    resp_tx.send(Ok(last)).await.map_err(|e| Error::ChannelError {
        context: format!("Failed to forward eof: {e}"),
    })?;
    Ok(frames)
}

fn validate(frame: &StreamFrame, part_id: PartId, config: &ServerConfig) -> partstream_tonic_core::Result<()> {
    if frame.part_id != part_id {
        return Err(Error::InvalidRequest {
            reason: format!("frame for partition {} on exchange of partition {part_id}", frame.part_id),
        });
    }
    if frame.init.is_some() {
        return Err(Error::InvalidRequest {
            reason: "init handshake sent twice".to_string(),
        });
    }
    let bytes: usize = frame.data.iter().map(Bytes::len).sum();
    if bytes > config.max_frame_bytes {
        return Err(Error::InvalidRequest {
            reason: format!(
                "frame of {bytes} bytes exceeds maximum allowed ({})",
                config.max_frame_bytes
            ),
        });
    }
    Ok(())
}

/// Hands one frame to the next worker and forwards what it produces.
async fn dispatch(
    worker_pool: &WorkerPool,
    resp_tx: &mpsc::Sender<Result<StreamFrame, Status>>,
    part_id: PartId,
    msg_id: u64,
    data: Vec<Bytes>,
) -> partstream_tonic_core::Result<()> {
    // Temporary channel used to receive the processed frame from the worker.
    let (tx, mut rx) = mpsc::channel(2);
    worker_pool
        .send_to_next_worker(WorkRequest::Frame {
            part_id,
            msg_id,
            data,
            tx,
        })
        .await?;

    while let Some(msg) = rx.recv().await {
        if let Err(e) = resp_tx.send(msg).await {
            return Err(Error::ChannelError {
                context: format!("Failed to forward frame: {e}"),
            });
        }
    }
    Ok(())
}
