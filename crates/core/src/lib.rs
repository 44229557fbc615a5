//! cleanpass-core
//!
//! Post-analysis cleanup for disassembled x86 binaries.
//!
//! Given an analysis database that an automated disassembler has already been
//! through, the cleanup runner sweeps a set of code regions and repairs what
//! was left behind: stray data sitting in code, missing alignment padding,
//! undecoded instructions and functions nobody created.
//!
//! The passes only see the database through [`db::AnalysisDb`], so every
//! heuristic is testable against the in-memory [`db::MemoryDb`]. The CLI (and
//! anything else) drives a run through [`services::pipeline::CleanupRunner`].

pub mod analysis;
pub mod config;
pub mod db;
pub mod model;
pub mod services;

pub use config::{CleanupConfig, Pass, PassSelection};
pub use services::pipeline::{CleanupRunner, RunError, RunObserver, RunReport};

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
