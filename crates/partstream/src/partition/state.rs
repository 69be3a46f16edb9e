use crate::PartId;
use parking_lot::{Mutex, MutexGuard};
use portable_atomic::{AtomicBool, Ordering};

/// A rejected one-shot state transition.
#[derive(Clone, Copy, thiserror::Error, Debug, PartialEq, Eq)]
pub enum StateError {
    /// The outbound side of the partition was already closed.
    #[error("outbound side of partition {part_id} already closed")]
    OutboundAlreadyClosed { part_id: PartId },
}

/// A flag that can only move from `false` to `true`.
///
/// [`OneShot::set`] returns `true` for exactly one caller: the one whose swap
/// performed the transition.
#[derive(Debug, Default)]
struct OneShot(AtomicBool);

impl OneShot {
    fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

#[derive(Debug, Default)]
struct PartState {
    inited: OneShot,
    outbound_closed: OneShot,
    inbound_closed: OneShot,
    cancelled: OneShot,
    collected: OneShot,
    forced_eof: OneShot,
    abandoned: OneShot,
    // Serializes transport-level cancel against inbound processing for this
    // partition. Does not guard the flags above.
    cancel_lock: Mutex<()>,
}

#[cfg(feature = "cache-padded")]
type Slot = crossbeam_utils::CachePadded<PartState>;
#[cfg(not(feature = "cache-padded"))]
type Slot = PartState;

/// Per-partition lifecycle flags plus a per-partition transport-cancel lock.
///
/// Every flag is a one-shot atomic; there is no table-wide lock, so
/// transitions on different partitions never contend.
///
/// All accessors index by partition id and panic if the id is outside
/// `0..part_count`. Callers validate ids against the
/// [`PartitionSet`](crate::PartitionSet) first.
#[derive(Debug)]
pub struct StateTable {
    parts: Box<[Slot]>,
}

impl StateTable {
    pub fn new(part_count: u32) -> Self {
        let parts = (0..part_count).map(|_| Slot::default()).collect();
        Self { parts }
    }

    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    fn part(&self, part_id: PartId) -> &PartState {
        &self.parts[part_id as usize]
    }

    pub fn inited(&self, part_id: PartId) -> bool {
        self.part(part_id).inited.get()
    }

    /// Marks the partition initialized. Returns `true` if this call
    /// performed the transition, i.e. the caller owns the init handshake.
    pub fn set_inited(&self, part_id: PartId) -> bool {
        self.part(part_id).inited.set()
    }

    pub fn outbound_closed(&self, part_id: PartId) -> bool {
        self.part(part_id).outbound_closed.get()
    }

    /// Closes the partition's outbound side.
    ///
    /// # Errors
    ///
    /// A second close is a protocol violation and returns
    /// [`StateError::OutboundAlreadyClosed`].
    pub fn set_outbound_closed(&self, part_id: PartId) -> Result<(), StateError> {
        if self.part(part_id).outbound_closed.set() {
            Ok(())
        } else {
            Err(StateError::OutboundAlreadyClosed { part_id })
        }
    }

    pub fn inbound_closed(&self, part_id: PartId) -> bool {
        self.part(part_id).inbound_closed.get()
    }

    /// Returns `true` if this call closed the inbound side.
    pub fn set_inbound_closed(&self, part_id: PartId) -> bool {
        self.part(part_id).inbound_closed.set()
    }

    pub fn cancelled(&self, part_id: PartId) -> bool {
        self.part(part_id).cancelled.get()
    }

    /// Records a cancel received from the remote side.
    pub fn receive_cancel(&self, part_id: PartId) {
        self.part(part_id).cancelled.set();
    }

    /// Returns `true` only for the call that claims diagnostics collection.
    pub fn set_collected(&self, part_id: PartId) -> bool {
        self.part(part_id).collected.set()
    }

    pub fn forced_eof(&self, part_id: PartId) -> bool {
        self.part(part_id).forced_eof.get()
    }

    /// Returns `true` only for the call that claims forced-eof propagation.
    pub fn set_forced_eof(&self, part_id: PartId) -> bool {
        self.part(part_id).forced_eof.set()
    }

    pub fn abandoned(&self, part_id: PartId) -> bool {
        self.part(part_id).abandoned.get()
    }

    /// Marks a partition that was finished before anything was sent to it.
    pub fn set_abandoned(&self, part_id: PartId) -> bool {
        self.part(part_id).abandoned.set()
    }

    /// Whether the partition no longer blocks job completion: its inbound
    /// side closed naturally, was force-stopped, or it was abandoned before
    /// initialization.
    pub fn closed(&self, part_id: PartId) -> bool {
        let part = self.part(part_id);
        part.inbound_closed.get() || part.forced_eof.get() || part.abandoned.get()
    }

    /// Acquires the partition's transport-cancel lock. Released when the
    /// guard drops, on every exit path.
    pub fn lock(&self, part_id: PartId) -> MutexGuard<'_, ()> {
        self.part(part_id).cancel_lock.lock()
    }
}
