//! Data model for presets and computes.

mod compute;
mod preset;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use compute::*;
pub use preset::*;
