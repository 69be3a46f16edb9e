//! Shared ownership of a bound [`Transport`].
//!
//! The coordinator and every transport callback that is currently running
//! hold a [`StreamHandle`]. Whoever drops the last one may be executing inside
//! the transport itself, so the transport is never destroyed inline: the last
//! release pushes a teardown job onto the [`WorkQueue`].

use crate::{Job, Transport, WorkQueue};
use core::{fmt, ops::Deref};
use std::sync::Arc;

/// A reference-counted handle to a bound transport.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    transport: Option<Box<dyn Transport>>,
    queue: Arc<dyn WorkQueue>,
}

impl StreamHandle {
    pub fn new(transport: Box<dyn Transport>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                transport: Some(transport),
                queue,
            }),
        }
    }

    /// Number of live handles.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn transport(&self) -> &(dyn Transport + 'static) {
        match &self.inner.transport {
            Some(transport) => transport.as_ref(),
            // Only `Drop` takes the transport out.
            None => unreachable!("transport taken before last release"),
        }
    }
}

impl Deref for StreamHandle {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        self.transport()
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("holders", &self.holders())
            .finish_non_exhaustive()
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            tracing::trace!("Last stream handle released, deferring teardown");
            self.queue.push(Box::new(DestroyStream {
                transport: Some(transport),
            }));
        }
    }
}

/// Drops a transport on the work queue's thread.
struct DestroyStream {
    transport: Option<Box<dyn Transport>>,
}

impl Job for DestroyStream {
    fn process(&mut self) {
        if let Some(transport) = self.transport.take() {
            drop(transport);
            tracing::trace!("Stream destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, ManualQueue};

    #[test]
    fn last_release_defers_teardown() {
        let queue = Arc::new(ManualQueue::new());
        let (transport, state) = FakeTransport::new(2);
        let handle = StreamHandle::new(Box::new(transport), queue.clone());
        let callback_copy = handle.clone();
        assert_eq!(handle.holders(), 2);
        assert_eq!(handle.part_count(), 2);

        drop(handle);
        assert_eq!(queue.len(), 0);
        assert!(!state.is_dropped());

        drop(callback_copy);
        assert_eq!(queue.len(), 1);
        assert!(!state.is_dropped());

        assert_eq!(queue.run_pending(), 1);
        assert!(state.is_dropped());
    }

    #[test]
    fn clones_share_one_transport() {
        let queue = Arc::new(ManualQueue::new());
        let (transport, state) = FakeTransport::new(3);
        let handle = StreamHandle::new(Box::new(transport), queue);
        let copy = handle.clone();

        let transport: &dyn Transport = copy.transport();
        transport.send_cancel(2);
        handle.send_cancel(0);
        assert_eq!(transport.part_count(), 3);
        assert_eq!(state.cancels(), vec![2, 0]);
    }

    #[test]
    fn closed_queue_destroys_inline() {
        let queue = Arc::new(ManualQueue::new());
        queue.close();
        let (transport, state) = FakeTransport::new(1);
        drop(StreamHandle::new(Box::new(transport), queue.clone()));
        assert!(state.is_dropped());
        assert_eq!(queue.len(), 0);
    }
}
