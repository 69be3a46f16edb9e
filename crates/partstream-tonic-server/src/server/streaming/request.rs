use bytes::Bytes;
use partstream_tonic_core::{partstream::PartId, proto::StreamFrame};
use tokio::sync::{mpsc, oneshot};
use tonic::Status;

/// A message sent from the worker pool to an individual worker task.
///
/// [`WorkRequest`]s are sent over bounded channels and are consumed by the
/// worker's main loop.
#[derive(Debug)]
pub enum WorkRequest {
    /// Process the data chunks of one inbound frame.
    ///
    /// - `part_id`/`msg_id`: Identify the frame being answered.
    /// - `data`: The frame's data chunks.
    /// - `tx`: Output channel for the resulting frames. Dropped by the worker
    ///   when it is done, which tells the exchange to move on.
    Frame {
        part_id: PartId,
        msg_id: u64,
        data: Vec<Bytes>,
        tx: mpsc::Sender<Result<StreamFrame, Status>>,
    },

    /// Request the worker to shut down gracefully.
    ///
    /// - `response`: One-shot channel for acknowledging that the worker has
    ///   completed its shutdown routine.
    Shutdown { response: oneshot::Sender<()> },
}
