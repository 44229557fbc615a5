//! Per-run state threaded through the passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::analysis::tail::TailFinding;
use crate::config::CleanupConfig;
use crate::model::Region;
use crate::services::pipeline::{RunObserver, RunReport, State};

/// Counters for one region; summed into run totals at the end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCounters {
    /// Data items turned back into unknown bytes.
    pub unknown_data_count: u64,
    /// Data items re-tagged as byte arrays (switch index tables).
    pub byte_tables: u64,
    pub align_fixes: u64,
    pub align_failures: u64,
    pub code_fixes: u64,
    pub code_misses: u64,
    /// Function pairs visited by the gap pass.
    pub func_index: u64,
    /// Function pairs the gap pass considered.
    pub func_count: u64,
    pub functions_created: u64,
    pub gaps_aborted: u64,
    pub pass1_loop_count: u64,
}

impl PassCounters {
    pub fn accumulate(&mut self, other: &PassCounters) {
        self.unknown_data_count += other.unknown_data_count;
        self.byte_tables += other.byte_tables;
        self.align_fixes += other.align_fixes;
        self.align_failures += other.align_failures;
        self.code_fixes += other.code_fixes;
        self.code_misses += other.code_misses;
        self.func_index += other.func_index;
        self.func_count += other.func_count;
        self.functions_created += other.functions_created;
        self.gaps_aborted += other.gaps_aborted;
        self.pass1_loop_count += other.pass1_loop_count;
    }
}

/// Marker returned by a pass that noticed a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Shared cancellation flag, cheap to clone across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NullObserver;

impl RunObserver for NullObserver {}

/// Mutable run state handed to every pass.
pub struct RunContext<'a> {
    pub config: &'a CleanupConfig,
    /// Region currently being processed.
    pub region: Region,
    /// Counters for the current region.
    pub counters: PassCounters,
    pub unexpected_tails: Vec<TailFinding>,
    cancel: CancelToken,
    observer: &'a mut dyn RunObserver,
    ticks: u64,
}

impl<'a> RunContext<'a> {
    pub fn new(
        config: &'a CleanupConfig,
        region: Region,
        cancel: CancelToken,
        observer: &'a mut dyn RunObserver,
    ) -> Self {
        Self {
            config,
            region,
            counters: PassCounters::default(),
            unexpected_tails: Vec::new(),
            cancel,
            observer,
            ticks: 0,
        }
    }

    /// Count one scan step; every `poll_interval` steps report progress and
    /// check for cancellation.
    pub fn checkpoint(&mut self, ea: u64) -> Result<(), Cancelled> {
        self.ticks += 1;
        if self.ticks % self.config.poll_interval.max(1) != 0 {
            return Ok(());
        }
        self.observer.progress(ea);
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Switch to a new region and reset the per-region counters.
    pub fn begin_region(&mut self, region: Region) {
        self.region = region;
        self.counters = PassCounters::default();
    }

    pub fn report_tail(&mut self, finding: TailFinding) {
        warn!(
            "0x{:X} \"{}\" problem? unexpected function tail (function 0x{:X})",
            finding.address, finding.name, finding.function_start
        );
        self.observer.unexpected_tail(&finding);
        self.unexpected_tails.push(finding);
    }

    pub fn state_changed(&mut self, state: State) {
        self.observer.state_changed(state);
    }

    pub fn finished(&mut self, report: &RunReport) {
        self.observer.finished(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_poll_at_the_interval() {
        let config = CleanupConfig { poll_interval: 3, ..CleanupConfig::default() };
        let cancel = CancelToken::new();
        let mut observer = NullObserver;
        let mut ctx =
            RunContext::new(&config, Region::new(".text", 0, 16), cancel.clone(), &mut observer);

        cancel.cancel();
        assert_eq!(ctx.checkpoint(0), Ok(()));
        assert_eq!(ctx.checkpoint(1), Ok(()));
        assert_eq!(ctx.checkpoint(2), Err(Cancelled));
    }

    #[test]
    fn counters_accumulate() {
        let mut total = PassCounters::default();
        let region = PassCounters { align_fixes: 2, code_fixes: 5, ..PassCounters::default() };
        total.accumulate(&region);
        total.accumulate(&region);
        assert_eq!(total.align_fixes, 4);
        assert_eq!(total.code_fixes, 10);
    }
}
