//! Contracts between the coordinator and the RPC layer underneath it.
//!
//! A [`Session`] binds a stream for one job and returns a boxed
//! [`Transport`]. The transport calls back into the coordinator through
//! [`StreamHandler`], from its own I/O threads, possibly concurrently for
//! different partitions.

use crate::{
    BindError, InboundMessage, MatchTag, OutboundMessage, PartId, RemoteErrorCode, RpcInfo,
};
use core::time::Duration;
use std::sync::Weak;

/// Everything a session needs to bind a stream for one job.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindRequest {
    pub biz_name: String,
    /// Empty means every partition.
    pub part_ids: Vec<PartId>,
    pub tags: Vec<MatchTag>,
    pub enable_probe: bool,
    /// Time budget left for the job.
    pub timeout: Option<Duration>,
    /// Run transport callbacks on the transport's async runtime instead of
    /// dedicated I/O threads.
    pub async_io: bool,
}

/// The RPC side of one bound stream.
pub trait Transport: Send + Sync {
    /// Partition count of the bound target, as declared by the target.
    fn part_count(&self) -> u32;

    /// Hands `message` to partition `part_id`. `eof` closes the outbound side
    /// of that partition. Returns `false` if the transport refused the
    /// message.
    fn send(&self, part_id: PartId, eof: bool, message: OutboundMessage) -> bool;

    /// Requests cancellation of the partition's stream. Cooperative: the
    /// stream may keep delivering for a while.
    ///
    /// Must not call back into the [`StreamHandler`] on the calling thread;
    /// the coordinator may hold that partition's cancel lock.
    fn send_cancel(&self, part_id: PartId);

    /// Traffic and timing of the partition's stream so far.
    fn rpc_info(&self, part_id: PartId) -> RpcInfo;
}

/// Callbacks a [`Transport`] invokes on the coordinator.
///
/// Each returns `false` when the callback failed; the transport only uses
/// this for logging.
pub trait StreamHandler: Send + Sync {
    fn receive(&self, message: InboundMessage) -> bool;

    fn receive_cancel(&self, message: InboundMessage, code: RemoteErrorCode) -> bool;

    fn on_send_failure(&self, part_id: PartId) -> bool;
}

/// Supplies tracing context and the ability to bind a transport.
pub trait Session: Send + Sync {
    /// The caller's trace id, forwarded to every partition.
    fn trace_id(&self) -> Option<String> {
        None
    }

    /// Binds a stream for `request`.
    ///
    /// The transport keeps only a weak reference to `handler`, so a bound
    /// transport never keeps its coordinator alive.
    ///
    /// # Errors
    ///
    /// Returns a [`BindError`] if the target does not exist or cannot serve.
    fn bind(
        &self,
        request: &BindRequest,
        handler: Weak<dyn StreamHandler>,
    ) -> Result<Box<dyn Transport>, BindError>;
}
