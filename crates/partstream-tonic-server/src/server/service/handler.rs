//! gRPC service implementation of the partition host.
//!
//! This module defines [`PartitionService`], the concrete implementation of
//! the [`PartitionStream`] gRPC service. Every `Exchange` call is one
//! partition of one client job.
//!
//! ## Responsibilities
//!
//! - Spawn and manage a background worker pool.
//! - Validate the init handshake that opens every exchange.
//! - Feed data frames through the workers via [`feed_frames`], bounded by the
//!   job's remaining time budget.
//! - Handle backpressure, cancellation, and graceful shutdown.

use crate::server::{
    config::ServerConfig,
    pool::{manager::WorkerPool, worker::worker_loop},
    streaming::{coordinator::feed_frames, handshake::accept_handshake},
    telemetry::{
        increment_exchanges, increment_frames_echoed, increment_stream_errors,
        record_exchange_duration, record_payload_bytes,
    },
};
use core::{pin::Pin, time::Duration};
use futures::TryStreamExt;
use partstream_tonic_core::{
    Error,
    proto::{StreamFrame, partition_stream_server::PartitionStream},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

/// gRPC partition host.
///
/// Implements the [`PartitionStream`] service. Each exchange validates the
/// client's handshake, then streams the processed data back in request order,
/// followed by a final `eof` frame.
#[derive(Clone)]
pub struct PartitionService {
    config: ServerConfig,
    worker_pool: Arc<WorkerPool>,
}

impl PartitionService {
    /// Creates a new `PartitionService` and spawns a pool of background worker
    /// tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let mut workers = Vec::with_capacity(config.num_workers);
        let shutdown_token = CancellationToken::new();

        for worker_id in 0..config.num_workers {
            // An exchange waits for each frame's results before dispatching
            // the next one, so one queued request per worker is enough.
            let (tx, rx) = mpsc::channel(1);
            workers.push(tx);
            tokio::spawn(worker_loop(worker_id, rx));
        }

        let worker_pool = WorkerPool::new(
            workers,
            shutdown_token,
            Duration::from_secs(config.shutdown_timeout),
        );

        Self {
            config,
            worker_pool: Arc::new(worker_pool),
        }
    }

    /// Number of exchanges currently being served.
    pub fn inflight(&self) -> usize {
        self.worker_pool.inflight()
    }

    /// Initiates a graceful shutdown of the worker pool.
    ///
    /// New exchanges are refused, in-flight ones get the configured drain
    /// time, and the call returns once each worker acknowledged termination.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.worker_pool.shutdown().await
    }
}

#[tonic::async_trait]
impl PartitionStream for PartitionService {
    type ExchangeStream = Pin<Box<dyn Stream<Item = Result<StreamFrame, Status>> + Send>>;

    /// Serves one partition of a client job.
    ///
    /// The first frame must carry the init handshake; an invalid handshake
    /// fails the call with `InvalidArgument` before any frame is returned.
    ///
    /// If `metrics` is enabled, emits telemetry for:
    /// - accepted exchanges and payload sizes
    /// - concurrent exchange count
    /// - exchange duration
    /// - frames echoed
    /// - stream errors
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn exchange(
        &self,
        req: Request<Streaming<StreamFrame>>,
    ) -> Result<Response<Self::ExchangeStream>, Status> {
        let start = std::time::Instant::now();
        let guard = self
            .worker_pool
            .begin_exchange()
            .inspect_err(|_| increment_stream_errors())?;

        let mut inbound = req.into_inner();
        let mut first = match inbound.message().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                increment_stream_errors();
                return Err(Error::InvalidRequest {
                    reason: "exchange closed before the init handshake".to_string(),
                }
                .into());
            }
            Err(status) => {
                increment_stream_errors();
                return Err(status);
            }
        };
        let accepted = accept_handshake(&mut first).inspect_err(|_e| {
            increment_stream_errors();
            #[cfg(feature = "tracing")]
            tracing::warn!("Rejected handshake: {}", _e);
        })?;

        increment_exchanges();
        record_payload_bytes(accepted.init.payload.len() as f64);

        let part_id = accepted.init.part_id;
        let budget = accepted.init.remaining_ms.map(Duration::from_millis);
        #[cfg(feature = "tracing")]
        tracing::debug!(
            part_id,
            part_count = accepted.init.part_count,
            graph_id = accepted.init.graph_id,
            biz = accepted.biz_name(),
            trace_id = accepted.init.diagnostics.trace_id.as_deref().unwrap_or(""),
            remaining_ms = accepted.init.remaining_ms,
            "Exchange accepted"
        );

        let (resp_tx, resp_rx) =
            mpsc::channel::<Result<StreamFrame, Status>>(self.config.stream_buffer_size);

        let worker_pool = Arc::clone(&self.worker_pool);
        let config = self.config.clone();

        let fut = async move {
            let _guard = guard;
            let deadline_tx = resp_tx.clone();
            let exchange = feed_frames(first, inbound, part_id, worker_pool, resp_tx, config);
            let result = match budget {
                Some(budget) => match tokio::time::timeout(budget, exchange).await {
                    Ok(result) => result,
                    Err(_) => {
                        let _ = deadline_tx.send(Err(Error::DeadlineExceeded.into())).await;
                        Err(Error::DeadlineExceeded)
                    }
                },
                None => exchange.await,
            };
            match result {
                Ok(_frames) => {
                    record_exchange_duration(start.elapsed().as_millis() as f64);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(part_id, frames = _frames, "Exchange finished");
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(part_id, "Error: {}", _e);
                }
            }
        };
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            let span = tracing::info_span!("exchange", part_id);
            fut.instrument(span)
        };

        tokio::spawn(fut);

        let stream = ReceiverStream::new(resp_rx)
            .inspect_ok(|_frame| increment_frames_echoed())
            .inspect_err(|_e| increment_stream_errors());

        Ok(Response::new(Box::pin(stream)))
    }
}
