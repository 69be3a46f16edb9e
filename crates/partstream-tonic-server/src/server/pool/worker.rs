use crate::server::streaming::{processor::handle_frame_request, request::WorkRequest};
use tokio::sync::mpsc;

/// Worker task responsible for processing [`WorkRequest`] messages.
///
/// The worker listens on an MPSC channel and processes requests until a
/// shutdown signal is received or every sender is gone.
///
/// # Request Types
///
/// - [`WorkRequest::Frame`] - Processes one frame's data via
///   [`handle_frame_request`].
/// - [`WorkRequest::Shutdown`] - Signals the worker to stop and acknowledge
///   shutdown.
pub async fn worker_loop(worker_id: usize, mut rx: mpsc::Receiver<WorkRequest>) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    let mut frames = 0_u64;

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Frame {
                part_id,
                msg_id,
                data,
                tx,
            } => {
                frames += 1;
                handle_frame_request(worker_id, part_id, msg_id, data, tx).await;
            }
            WorkRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped after {frames} frames");
    #[cfg(not(feature = "tracing"))]
    let _ = (worker_id, frames);
}
