//! The business-level channels around the coordinator.
//!
//! Upstream [`InputChannel`]s say when all data destined for a partition has
//! been handed over, which gates the outbound close. Received payloads are
//! fanned out by a [`Demux`]; [`OutputChannel`]s learn when a partition's
//! inbound side ended early.

use crate::{InboundMessage, PartId};
use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

/// Demultiplexing failed; the job cannot continue.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[error("demux failed on partition {part_id}: {reason}")]
pub struct DemuxError {
    pub part_id: PartId,
    pub reason: String,
}

/// Upstream data feeding the partitions.
pub trait InputChannel: Send + Sync {
    /// Whether every item destined for `part_id` has been handed over.
    fn eof(&self, part_id: PartId) -> bool;
}

/// Downstream consumer of one partition's results.
pub trait OutputChannel: Send + Sync {
    /// The partition will deliver nothing more. Called at most once per
    /// partition by the coordinator when it force-stops a partition.
    fn set_eof(&self, part_id: PartId);
}

/// Fans a received message into the business-level outputs.
pub trait Demux: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`DemuxError`] if the payload could not be delivered.
    fn demux(&self, message: &InboundMessage) -> Result<(), DemuxError>;
}

#[derive(Debug, Default)]
struct EofSet {
    all: AtomicBool,
    parts: Mutex<BTreeSet<PartId>>,
}

impl EofSet {
    fn insert(&self, part_id: PartId) -> bool {
        self.parts.lock().insert(part_id)
    }

    fn contains(&self, part_id: PartId) -> bool {
        self.all.load(Ordering::Acquire) || self.parts.lock().contains(&part_id)
    }
}

/// An [`InputChannel`] driven by explicit close calls.
#[derive(Debug, Default)]
pub struct InputPort {
    eof: EofSet,
}

impl InputPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything for `part_id` has been handed over.
    pub fn close(&self, part_id: PartId) {
        self.eof.insert(part_id);
    }

    pub fn close_all(&self) {
        self.eof.all.store(true, Ordering::Release);
    }
}

impl InputChannel for InputPort {
    fn eof(&self, part_id: PartId) -> bool {
        self.eof.contains(part_id)
    }
}

/// An [`OutputChannel`] and [`Demux`] that forwards payloads into a Tokio
/// channel and remembers which partitions ended.
#[derive(Debug)]
pub struct OutputPort {
    tx: mpsc::UnboundedSender<(PartId, Bytes)>,
    eof: EofSet,
    forced: EofSet,
}

impl OutputPort {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(PartId, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let port = Self {
            tx,
            eof: EofSet::default(),
            forced: EofSet::default(),
        };
        (port, rx)
    }

    /// Whether `part_id` ended, naturally or forced.
    pub fn eof(&self, part_id: PartId) -> bool {
        self.eof.contains(part_id)
    }

    /// Whether `part_id` was force-stopped by the coordinator.
    pub fn forced(&self, part_id: PartId) -> bool {
        self.forced.contains(part_id)
    }

    pub fn eof_parts(&self) -> Vec<PartId> {
        self.eof.parts.lock().iter().copied().collect()
    }
}

impl OutputChannel for OutputPort {
    fn set_eof(&self, part_id: PartId) {
        self.forced.insert(part_id);
        self.eof.insert(part_id);
    }
}

impl Demux for OutputPort {
    fn demux(&self, message: &InboundMessage) -> Result<(), DemuxError> {
        if let Some(payload) = &message.payload {
            self.tx
                .send((message.part_id, payload.clone()))
                .map_err(|_| DemuxError {
                    part_id: message.part_id,
                    reason: "output receiver dropped".to_string(),
                })?;
        }
        if message.eof {
            self.eof.insert(message.part_id);
        }
        Ok(())
    }
}
