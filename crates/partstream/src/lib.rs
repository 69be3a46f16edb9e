//! Client-side coordination of one computation fanned out to many remote
//! partitions.
//!
//! See [`Coordinator`] for the protocol and [`testing`] (behind the `testing`
//! feature) for in-memory doubles of every collaborator.

mod channel;
mod codec;
mod coordinator;
mod descriptor;
mod diagnostics;
mod error;
mod message;
mod partition;
mod queue;
mod random;
mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod transport;

pub use crate::channel::*;
pub use crate::codec::*;
pub use crate::coordinator::*;
pub use crate::descriptor::*;
pub use crate::diagnostics::*;
pub use crate::error::*;
pub use crate::message::*;
pub use crate::partition::*;
pub use crate::queue::*;
pub use crate::random::*;
pub use crate::stream::*;
pub use crate::transport::*;

/// Identifies one partition of the remote target, in `0..part_count`.
pub type PartId = u32;
