//! Analysis database integration.
//!
//! The cleanup passes never own bytes, items or functions; they query and
//! mutate an analysis database through [`AnalysisDb`]. This module defines:
//! - `AnalysisDb`: the collaborator interface the passes are written against.
//! - `MemoryDb`: an in-memory implementation with a small background
//!   reanalysis queue, used by the CLI and the test-suite.

mod memory;

pub use memory::{MemoryDb, Segment};

use crate::analysis::classify;
use crate::model::{Flags, FunctionInfo, Insn, SegmentInfo};

/// The host disassembler's model of an image, as the cleanup passes see it.
///
/// Queries take `&self`; every mutation may queue background reanalysis, so
/// callers settle with [`AnalysisDb::wait_idle`] before trusting flags again.
pub trait AnalysisDb {
    /// Loaded segments in address order.
    fn segments(&self) -> Vec<SegmentInfo>;

    /// Flags snapshot at `ea`.
    fn flags(&self, ea: u64) -> Flags;

    /// Raw byte at `ea`, `None` when nothing is loaded there.
    fn byte(&self, ea: u64) -> Option<u8>;

    /// Size of the item starting at `ea` (1 for unknown bytes).
    fn item_size(&self, ea: u64) -> u64;

    /// The data item at `ea` is an array of single-byte elements.
    fn is_byte_array(&self, ea: u64) -> bool;

    /// First item head strictly after `ea` and below `limit`.
    fn next_head(&self, ea: u64, limit: u64) -> Option<u64>;

    /// Last item head strictly before `ea` and at or above `floor`.
    fn prev_head(&self, ea: u64, floor: u64) -> Option<u64>;

    /// First address in `[ea, limit)` whose flags satisfy `pred`.
    fn find_next(&self, ea: u64, limit: u64, pred: &dyn Fn(&Flags) -> bool) -> Option<u64> {
        (ea..limit).find(|&addr| pred(&self.flags(addr)))
    }

    /// First unknown byte in `[ea, limit)`.
    fn next_unknown(&self, ea: u64, limit: u64) -> Option<u64> {
        self.find_next(ea, limit, &classify::is_unknown)
    }

    /// Decode one instruction at `ea` without changing the database.
    fn decode(&self, ea: u64) -> Option<Insn>;

    fn first_cref_from(&self, ea: u64) -> Option<u64>;
    fn first_cref_to(&self, ea: u64) -> Option<u64>;
    fn first_dref_from(&self, ea: u64) -> Option<u64>;
    fn first_dref_to(&self, ea: u64) -> Option<u64>;

    fn function_count(&self) -> usize;

    /// Function by its index in address order.
    fn function_by_index(&self, index: usize) -> Option<FunctionInfo>;

    /// Function or function chunk containing `ea`.
    fn function_chunk(&self, ea: u64) -> Option<FunctionInfo>;

    /// Display name for `ea`, if it has one.
    fn name_at(&self, ea: u64) -> Option<String>;

    /// No background analysis is pending.
    fn is_idle(&self) -> bool;

    /// Undefine every item overlapping `[start, end)`.
    fn make_unknown(&mut self, start: u64, end: u64);

    /// Materialize `len` bytes at `ea` as one alignment item.
    fn make_align(&mut self, ea: u64, len: u64) -> bool;

    /// Materialize `len` bytes at `ea` as an array of single-byte elements.
    fn make_byte_array(&mut self, ea: u64, len: u64) -> bool;

    /// Create one instruction at `ea`; returns its size.
    fn create_insn(&mut self, ea: u64) -> Option<u64>;

    /// Create a function at `start` and let the database bound its extent.
    fn add_function(&mut self, start: u64) -> bool;

    /// Block until background analysis has drained.
    fn wait_idle(&mut self);
}
