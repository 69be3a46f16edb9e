use crate::PartId;
use core::fmt;
use parking_lot::Mutex;

/// Per-partition RPC timing and traffic, read from the transport once the
/// partition is finished.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcInfo {
    pub part_id: PartId,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Unix millis of the first outbound frame.
    pub first_send_ms: Option<u64>,
    /// Unix millis of the last inbound frame.
    pub last_receive_ms: Option<u64>,
    pub remote_addr: Option<String>,
    pub cancelled: bool,
}

impl RpcInfo {
    pub fn elapsed_ms(&self) -> Option<u64> {
        match (self.first_send_ms, self.last_receive_ms) {
            (Some(begin), Some(end)) => Some(end.saturating_sub(begin)),
            _ => None,
        }
    }
}

impl fmt::Display for RpcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "part {} sent {}/{}B recv {}/{}B",
            self.part_id, self.frames_sent, self.bytes_sent, self.frames_received, self.bytes_received
        )?;
        if let Some(elapsed) = self.elapsed_ms() {
            write!(f, " {elapsed}ms")?;
        }
        if let Some(addr) = &self.remote_addr {
            write!(f, " @{addr}")?;
        }
        if self.cancelled {
            f.write_str(" cancelled")?;
        }
        Ok(())
    }
}

/// Who talked to whom: `(local identity, remote identity)`.
///
/// The local identity reads `"<biz>(<part>)"`; the remote identity is the
/// target business name.
pub type RpcPeer = (String, String);

/// Receives per-partition diagnostics. Called at most once per partition.
pub trait DiagnosticsSink: Send + Sync {
    fn append_rpc_info(&self, peer: RpcPeer, info: RpcInfo);
}

/// The default [`DiagnosticsSink`]: an append-only, mergeable list.
#[derive(Debug, Default)]
pub struct RpcInfoCollector {
    entries: Mutex<Vec<(RpcPeer, RpcInfo)>>,
}

impl RpcInfoCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves every entry of `other` to the end of this collector.
    pub fn merge(&self, other: &Self) {
        let mut moved = core::mem::take(&mut *other.entries.lock());
        self.entries.lock().append(&mut moved);
    }

    pub fn snapshot(&self) -> Vec<(RpcPeer, RpcInfo)> {
        self.entries.lock().clone()
    }

    /// One line per entry, in append order.
    pub fn format(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|((local, remote), info)| format!("{local} -> {remote}: {info}"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DiagnosticsSink for RpcInfoCollector {
    fn append_rpc_info(&self, peer: RpcPeer, info: RpcInfo) {
        self.entries.lock().push((peer, info));
    }
}
