use partstream::{PartId, RpcInfo};
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Traffic counters of one partition stream. Written by the sender and the
/// reader task, read once when the coordinator collects diagnostics.
#[derive(Debug, Default)]
pub(super) struct PartStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    // 0 means unset
    first_send_ms: AtomicU64,
    last_receive_ms: AtomicU64,
    cancelled: AtomicBool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

impl PartStats {
    pub(super) fn record_send(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        let _ = self
            .first_send_ms
            .compare_exchange(0, now_ms(), Ordering::Relaxed, Ordering::Relaxed);
    }

    pub(super) fn record_receive(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_receive_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub(super) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self, part_id: PartId, remote_addr: &str) -> RpcInfo {
        let millis = |value: &AtomicU64| Some(value.load(Ordering::Relaxed)).filter(|ms| *ms != 0);
        RpcInfo {
            part_id,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            first_send_ms: millis(&self.first_send_ms),
            last_receive_ms: millis(&self.last_receive_ms),
            remote_addr: Some(remote_addr.to_owned()),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}
