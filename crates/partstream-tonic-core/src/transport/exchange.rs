//! One bidirectional `Exchange` call per partition.
//!
//! A partition's call is opened by its first send. Outbound frames go through
//! an unbounded channel feeding the request stream, so [`Transport::send`]
//! never blocks the coordinator. A reader task per call forwards inbound
//! frames to the [`StreamHandler`] and ends on eof, on an error status or on
//! local cancellation.

use super::{Target, stats::PartStats};
use crate::{
    inbound_message, outbound_frame,
    proto::{StreamFrame, partition_stream_client::PartitionStreamClient},
    remote_error_code,
};
use core::{fmt, time::Duration};
use parking_lot::Mutex;
use partstream::{
    InboundMessage, OutboundMessage, PartId, RemoteErrorCode, RpcInfo, StreamHandler, Transport,
};
use std::sync::{Arc, Weak};
use tokio::{runtime::Handle, sync::mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Streaming, codec::CompressionEncoding, transport::Channel};

enum Outbound {
    /// No frame sent yet; the call is not open.
    Idle,
    Open(mpsc::UnboundedSender<StreamFrame>),
    /// Eof sent, cancelled, or the call is gone.
    Closed,
}

struct PartStream {
    remote: String,
    channel: Channel,
    outbound: Mutex<Outbound>,
    cancel: CancellationToken,
    stats: Arc<PartStats>,
}

/// The gRPC [`Transport`] of one bound job.
pub struct GrpcTransport {
    part_count: u32,
    handle: Handle,
    handler: Weak<dyn StreamHandler>,
    timeout: Option<Duration>,
    compression: Option<CompressionEncoding>,
    parts: Box<[PartStream]>,
}

impl GrpcTransport {
    pub(super) fn new(
        target: &Target,
        handle: Handle,
        handler: Weak<dyn StreamHandler>,
        timeout: Option<Duration>,
        compression: Option<CompressionEncoding>,
    ) -> Self {
        let parts = (0..target.part_count())
            .filter_map(|part_id| target.route(part_id))
            .map(|(remote, channel)| PartStream {
                remote: remote.clone(),
                channel: channel.clone(),
                outbound: Mutex::new(Outbound::Idle),
                cancel: CancellationToken::new(),
                stats: Arc::new(PartStats::default()),
            })
            .collect();
        Self {
            part_count: target.part_count(),
            handle,
            handler,
            timeout,
            compression,
            parts,
        }
    }

    fn part(&self, part_id: PartId) -> Option<&PartStream> {
        self.parts.get(part_id as usize)
    }

    /// Starts the call for `part_id` and returns the sender feeding its
    /// request stream.
    fn open(&self, part_id: PartId, part: &PartStream) -> mpsc::UnboundedSender<StreamFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut client = PartitionStreamClient::new(part.channel.clone());
        if let Some(encoding) = self.compression {
            client = client.send_compressed(encoding).accept_compressed(encoding);
        }
        let mut request = Request::new(UnboundedReceiverStream::new(rx));
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        tracing::trace!(part_id, remote = %part.remote, "Opening partition stream");
        self.handle.spawn(exchange(
            client,
            request,
            part_id,
            self.handler.clone(),
            part.cancel.clone(),
            part.stats.clone(),
        ));
        tx
    }
}

impl Transport for GrpcTransport {
    fn part_count(&self) -> u32 {
        self.part_count
    }

    fn send(&self, part_id: PartId, eof: bool, message: OutboundMessage) -> bool {
        let Some(part) = self.part(part_id) else {
            tracing::warn!(part_id, "Send to unknown partition");
            return false;
        };
        if part.cancel.is_cancelled() {
            return false;
        }
        let bytes = message.byte_len();
        let frame = outbound_frame(part_id, eof, message);

        let mut outbound = part.outbound.lock();
        if matches!(*outbound, Outbound::Idle) {
            *outbound = Outbound::Open(self.open(part_id, part));
        }
        let Outbound::Open(tx) = &*outbound else {
            return false;
        };
        // Counted first: the echo of this frame may arrive before `send` returns.
        part.stats.record_send(bytes);
        if tx.send(frame).is_err() {
            *outbound = Outbound::Closed;
            return false;
        }
        if eof {
            // Dropping the sender ends the request stream.
            *outbound = Outbound::Closed;
        }
        true
    }

    fn send_cancel(&self, part_id: PartId) {
        if let Some(part) = self.part(part_id) {
            part.stats.mark_cancelled();
            part.cancel.cancel();
            *part.outbound.lock() = Outbound::Closed;
        }
    }

    fn rpc_info(&self, part_id: PartId) -> RpcInfo {
        self.part(part_id).map_or_else(
            || RpcInfo {
                part_id,
                ..RpcInfo::default()
            },
            |part| part.stats.snapshot(part_id, &part.remote),
        )
    }
}

impl Drop for GrpcTransport {
    fn drop(&mut self) {
        for part in &self.parts {
            part.cancel.cancel();
        }
        tracing::trace!(parts = self.parts.len(), "gRPC transport dropped");
    }
}

impl fmt::Debug for GrpcTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcTransport")
            .field("part_count", &self.part_count)
            .field("timeout", &self.timeout)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

/// Drives one partition call until it ends.
///
/// Local cancellation stops the task silently: the coordinator already
/// finished the partition when it cancelled.
async fn exchange(
    mut client: PartitionStreamClient<Channel>,
    request: Request<UnboundedReceiverStream<StreamFrame>>,
    part_id: PartId,
    handler: Weak<dyn StreamHandler>,
    cancel: CancellationToken,
    stats: Arc<PartStats>,
) {
    let response = tokio::select! {
        () = cancel.cancelled() => return,
        response = client.exchange(request) => response,
    };
    let inbound = match response {
        Ok(response) => response.into_inner(),
        Err(status) => {
            tracing::debug!(part_id, code = ?status.code(), "Partition refused stream: {}", status.message());
            stats.mark_cancelled();
            deliver_cancel(&handler, part_id, remote_error_code(status.code()));
            return;
        }
    };
    read_frames(inbound, part_id, &handler, &cancel, &stats).await;
}

async fn read_frames(
    mut inbound: Streaming<StreamFrame>,
    part_id: PartId,
    handler: &Weak<dyn StreamHandler>,
    cancel: &CancellationToken,
    stats: &PartStats,
) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => {
                tracing::trace!(part_id, "Partition stream cancelled locally");
                return;
            }
            next = inbound.message() => next,
        };
        match next {
            Ok(Some(frame)) => {
                let message = inbound_message(part_id, frame);
                stats.record_receive(message.payload.as_ref().map_or(0, |payload| payload.len()));
                let eof = message.eof;
                let Some(handler) = handler.upgrade() else {
                    return;
                };
                if !handler.receive(message) {
                    tracing::debug!(part_id, "Coordinator rejected inbound frame");
                }
                if eof {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!(part_id, "Partition stream ended without eof");
                stats.mark_cancelled();
                deliver_cancel(handler, part_id, RemoteErrorCode::Internal);
                return;
            }
            Err(status) => {
                tracing::debug!(part_id, code = ?status.code(), "Partition stream failed: {}", status.message());
                stats.mark_cancelled();
                deliver_cancel(handler, part_id, remote_error_code(status.code()));
                return;
            }
        }
    }
}

fn deliver_cancel(handler: &Weak<dyn StreamHandler>, part_id: PartId, code: RemoteErrorCode) {
    if let Some(handler) = handler.upgrade() {
        let message = InboundMessage {
            part_id,
            ..InboundMessage::default()
        };
        if !handler.receive_cancel(message, code) {
            tracing::debug!(part_id, %code, "Coordinator rejected remote cancel");
        }
    }
}
