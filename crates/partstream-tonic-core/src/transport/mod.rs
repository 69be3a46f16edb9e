//! Tonic binding of the coordinator's [`Session`](partstream::Session) and
//! [`Transport`](partstream::Transport) contracts.

mod exchange;
mod session;
mod stats;

pub use exchange::*;
pub use session::*;
