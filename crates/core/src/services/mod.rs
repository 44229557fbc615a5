//! Services that sit around the cleanup passes: instruction decoding, binary
//! loading and the run orchestrator.

pub mod backends;
#[cfg(feature = "capstone-backend")]
pub mod loader;
pub mod pipeline;
