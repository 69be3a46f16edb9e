mod deferred;
mod interface;

pub use deferred::*;
pub use interface::*;
