//! Central management for presets and compute instances.

mod cache;
mod compute;
mod preset;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cache::*;
pub use compute::*;
pub use preset::*;
