//! Asynchronous worker pool for processing exchange frames.
//!
//! [`WorkerPool`] spreads [`WorkRequest`]s over its workers round-robin and
//! admits exchanges. Shutdown is phased: stop admitting, let in-flight
//! exchanges drain (bounded), cancel whatever is left through the shared
//! [`CancellationToken`], then stop the workers.

use crate::server::{
    streaming::request::WorkRequest,
    telemetry::{decrement_exchanges_inflight, increment_exchanges_inflight},
};
use core::time::Duration;
use partstream_tonic_core::Error;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::{
    sync::{Notify, mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// How long each worker gets to acknowledge shutdown.
const WORKER_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Exchanges currently admitted, and a wake-up for when there are none left.
#[derive(Debug, Default)]
struct Exchanges {
    count: AtomicUsize,
    idle: Notify,
}

/// Marks one exchange as in flight until dropped.
#[must_use]
#[derive(Debug)]
pub struct ExchangeGuard {
    exchanges: Arc<Exchanges>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if self.exchanges.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.exchanges.idle.notify_waiters();
        }
        decrement_exchanges_inflight();
    }
}

/// A cooperative pool of asynchronous workers that process [`WorkRequest`]s.
pub struct WorkerPool {
    workers: Vec<mpsc::Sender<WorkRequest>>,
    next_worker: AtomicUsize,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
    accepting: AtomicBool,
    exchanges: Arc<Exchanges>,
}

impl WorkerPool {
    /// Builds a pool over already spawned workers.
    ///
    /// `shutdown_timeout` bounds how long [`WorkerPool::shutdown`] waits for
    /// in-flight exchanges.
    pub fn new(
        workers: Vec<mpsc::Sender<WorkRequest>>,
        shutdown_token: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            shutdown_token,
            shutdown_timeout,
            accepting: AtomicBool::new(true),
            exchanges: Arc::default(),
        }
    }

    /// Returns the index of the next worker to receive work (round-robin).
    pub fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Admits a new exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once shutdown has started.
    pub fn begin_exchange(&self) -> Result<ExchangeGuard, Error> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }
        self.exchanges.count.fetch_add(1, Ordering::AcqRel);
        increment_exchanges_inflight();
        Ok(ExchangeGuard {
            exchanges: Arc::clone(&self.exchanges),
        })
    }

    pub fn inflight(&self) -> usize {
        self.exchanges.count.load(Ordering::Acquire)
    }

    /// Cancelled when remaining work must stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Queues `request` on the next worker, waiting for room in its channel.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceShutdown`] once the pool is cancelled,
    /// [`Error::ChannelError`] if the worker is gone.
    pub async fn send_to_next_worker(&self, request: WorkRequest) -> Result<(), Error> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        let worker_idx = self.next_worker_index();
        self.workers[worker_idx]
            .send(request)
            .await
            .map_err(|_| Error::ChannelError {
                context: format!("Worker {worker_idx} channel closed"),
            })
    }

    /// Gracefully shuts the pool down.
    ///
    /// Exchanges still running after `shutdown_timeout` are cancelled through
    /// the shutdown token. Workers that do not acknowledge within
    /// [`WORKER_ACK_TIMEOUT`] are left behind.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.accepting.store(false, Ordering::Release);
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new exchanges, draining {}", self.inflight());

        if !self.drain_exchanges().await {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Drain timed out, cancelling {} exchanges",
                self.inflight()
            );
        }
        self.shutdown_token.cancel();

        self.stop_workers().await;
        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }

    /// Waits up to `shutdown_timeout` for every exchange to finish. Returns
    /// whether they all did.
    async fn drain_exchanges(&self) -> bool {
        let drained = async {
            loop {
                // Registered before the check so a guard dropped in between
                // still wakes us.
                let idle = self.exchanges.idle.notified();
                if self.inflight() == 0 {
                    break;
                }
                idle.await;
            }
        };
        timeout(self.shutdown_timeout, drained).await.is_ok()
    }

    async fn stop_workers(&self) {
        let stops = self.workers.iter().enumerate().map(|(_i, worker)| async move {
            let (response, ack) = oneshot::channel();
            if worker.send(WorkRequest::Shutdown { response }).await.is_err() {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {_i} already stopped");
                return;
            }
            match timeout(WORKER_ACK_TIMEOUT, ack).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_i} stopped");
                }
                Ok(Err(_)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_i} dropped its shutdown ack");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_i} did not acknowledge shutdown");
                }
            }
        });
        futures::future::join_all(stops).await;
    }
}
