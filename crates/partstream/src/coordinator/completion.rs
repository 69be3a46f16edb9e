use super::Coordinator;
use crate::{ErrorCode, Job};
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Receives the single completion of a job.
///
/// Called exactly once per coordinator, from the work queue, never from a
/// transport callback thread.
pub trait FinishNotifier: Send + Sync {
    fn finish(&self, code: ErrorCode);
}

/// A [`FinishNotifier`] that async callers can wait on.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: watch::Sender<Option<ErrorCode>>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// The completion code, if the job has finished.
    pub fn get(&self) -> Option<ErrorCode> {
        *self.tx.borrow()
    }

    /// Resolves once the job has finished.
    pub async fn wait(&self) -> ErrorCode {
        let mut rx = self.tx.subscribe();
        // `self` owns the sender, so the channel cannot close under us.
        let code = rx.wait_for(Option::is_some).await.ok().and_then(|code| *code);
        code.unwrap_or(ErrorCode::None)
    }
}

impl FinishNotifier for CompletionSignal {
    fn finish(&self, code: ErrorCode) {
        self.tx.send_replace(Some(code));
    }
}

/// Counts queued or running jobs that reference a coordinator.
#[derive(Debug, Default)]
pub(super) struct InflightOps {
    count: AtomicUsize,
}

impl InflightOps {
    pub(super) fn acquire(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn release(&self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "async op released twice");
    }

    pub(super) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Delivers the completion from the work queue.
///
/// Owns a strong reference so the coordinator outlives the job, whether the
/// job is processed by the worker or destroyed inline on shutdown.
pub(super) struct NotifyFinishJob {
    coordinator: Option<Arc<Coordinator>>,
    code: ErrorCode,
}

impl NotifyFinishJob {
    pub(super) fn new(coordinator: Arc<Coordinator>, code: ErrorCode) -> Self {
        coordinator.ops.acquire();
        Self {
            coordinator: Some(coordinator),
            code,
        }
    }
}

impl Job for NotifyFinishJob {
    fn process(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.notify_finish(self.code);
            coordinator.ops.release();
        }
    }
}

impl Drop for NotifyFinishJob {
    fn drop(&mut self) {
        // A queue that drops jobs without running them still balances the
        // counter.
        if let Some(coordinator) = self.coordinator.take() {
            tracing::warn!(code = %self.code, "completion job dropped unprocessed");
            coordinator.ops.release();
        }
    }
}
