//! Background execution for completion notifications and stream teardown.
//!
//! [`DeferredQueue`] owns a single worker task fed by an unbounded channel.
//! Pushing never blocks, jobs run one at a time in push order, and every job
//! runs exactly once: on the worker, or inline through [`Job::destroy`] once
//! the queue is shut down.

use super::{Job, WorkQueue};
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    time::timeout,
};

enum WorkRequest {
    Run(Box<dyn Job>),
    Shutdown { response: oneshot::Sender<()> },
}

#[derive(Debug, Default)]
struct QueueStats {
    pushed: AtomicU64,
    processed: AtomicU64,
    destroyed: AtomicU64,
}

/// The production [`WorkQueue`].
pub struct DeferredQueue {
    tx: mpsc::UnboundedSender<WorkRequest>,
    closed: AtomicBool,
    stats: Arc<QueueStats>,
    shutdown_timeout: Duration,
}

impl DeferredQueue {
    /// Spawns the worker on `handle`.
    ///
    /// `shutdown_timeout` bounds how long [`DeferredQueue::shutdown`] waits
    /// for queued jobs to drain.
    pub fn spawn(handle: &Handle, shutdown_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(QueueStats::default());
        handle.spawn(worker_loop(rx, Arc::clone(&stats)));
        Self {
            tx,
            closed: AtomicBool::new(false),
            stats,
            shutdown_timeout,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Jobs pushed so far.
    pub fn pushed(&self) -> u64 {
        self.stats.pushed.load(Ordering::Relaxed)
    }

    /// Jobs executed on the worker.
    pub fn processed(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    /// Jobs executed inline because the queue had shut down.
    pub fn destroyed(&self) -> u64 {
        self.stats.destroyed.load(Ordering::Relaxed)
    }

    /// Stops accepting work and waits for the worker to drain what was
    /// already queued.
    ///
    /// Returns `true` if the worker acknowledged within the shutdown
    /// timeout. Calling this twice is harmless.
    pub async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return true;
        }

        tracing::debug!("Shutting down deferred queue ({} jobs pushed)", self.pushed());
        let (response, rx) = oneshot::channel();
        if self.tx.send(WorkRequest::Shutdown { response }).is_err() {
            tracing::warn!("Deferred queue worker already stopped");
            return false;
        }

        match timeout(self.shutdown_timeout, rx).await {
            Ok(Ok(())) => {
                tracing::debug!("Deferred queue drained ({} jobs processed)", self.processed());
                true
            }
            Ok(Err(_e)) => {
                tracing::error!("Deferred queue worker dropped shutdown acknowledgement");
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Deferred queue drain timed out after {:?}",
                    self.shutdown_timeout
                );
                false
            }
        }
    }

    fn destroy_inline(&self, job: Box<dyn Job>) {
        tracing::warn!("Deferred queue closed, running job inline");
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        job.destroy();
    }
}

impl WorkQueue for DeferredQueue {
    fn push(&self, job: Box<dyn Job>) {
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            self.destroy_inline(job);
            return;
        }
        if let Err(mpsc::error::SendError(WorkRequest::Run(job))) =
            self.tx.send(WorkRequest::Run(job))
        {
            self.destroy_inline(job);
        }
    }
}

async fn worker_loop(mut rx: mpsc::UnboundedReceiver<WorkRequest>, stats: Arc<QueueStats>) {
    tracing::trace!("Deferred queue worker started");

    while let Some(request) = rx.recv().await {
        match request {
            WorkRequest::Run(mut job) => {
                job.process();
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            WorkRequest::Shutdown { response } => {
                // Anything that raced in behind the shutdown request still
                // runs exactly once.
                rx.close();
                while let Ok(request) = rx.try_recv() {
                    if let WorkRequest::Run(job) = request {
                        stats.destroyed.fetch_add(1, Ordering::Relaxed);
                        job.destroy();
                    }
                }
                if response.send(()).is_err() {
                    tracing::error!("Deferred queue worker failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    tracing::trace!("Deferred queue worker stopped");
}
