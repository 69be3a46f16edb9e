mod set;
mod state;
#[cfg(test)]
mod tests;

pub use set::*;
pub use state::*;
