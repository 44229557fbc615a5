//! The cleanup passes and the pieces they share.
//!
//! Passes run in a fixed order over one region at a time:
//! 1. `stray_data`: data items inside code back to unknown bytes.
//! 2. `alignment`: padding runs to alignment items.
//! 3. `missing_code`: unknown bytes to instructions.
//! 4. `function_gaps`: code between functions to new functions.
//!
//! Each pass takes the database and the [`RunContext`] and returns early with
//! [`Cancelled`] when asked to stop.

pub mod alignment;
pub mod classify;
pub mod context;
pub mod cursor;
pub mod function_gaps;
pub mod missing_code;
pub mod stray_data;
pub mod tail;

pub use context::{CancelToken, Cancelled, NullObserver, PassCounters, RunContext};
pub use tail::{TailFinding, TailKind};
