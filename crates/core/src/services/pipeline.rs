//! Run orchestration: the state machine that sequences the passes over each
//! selected region, plus the end-of-run report.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::context::{CancelToken, Cancelled, PassCounters, RunContext};
use crate::analysis::tail::TailFinding;
use crate::analysis::{alignment, function_gaps, missing_code, stray_data};
use crate::config::{CleanupConfig, Pass, PassSelection};
use crate::db::AnalysisDb;
use crate::model::{Region, SegmentClass};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Init,
    Start,
    Pass1,
    Pass2,
    Pass3,
    Pass4,
    Finish,
    Exit,
}

impl State {
    pub fn pass(self) -> Option<Pass> {
        match self {
            State::Pass1 => Some(Pass::StrayData),
            State::Pass2 => Some(Pass::Alignment),
            State::Pass3 => Some(Pass::MissingCode),
            State::Pass4 => Some(Pass::FunctionGaps),
            _ => None,
        }
    }

    pub fn for_pass(pass: Pass) -> State {
        match pass {
            Pass::StrayData => State::Pass1,
            Pass::Alignment => State::Pass2,
            Pass::MissingCode => State::Pass3,
            Pass::FunctionGaps => State::Pass4,
        }
    }
}

/// Pure transition function. Cancellation is handled by the runner, which
/// jumps straight to [`State::Exit`].
pub fn next_state(state: State, passes: &PassSelection, more_regions: bool) -> State {
    match state {
        State::Init => State::Start,
        State::Start => passes.next_after(None).map_or(State::Finish, State::for_pass),
        State::Pass1 | State::Pass2 | State::Pass3 | State::Pass4 => {
            passes.next_after(state.pass()).map_or(State::Finish, State::for_pass)
        }
        State::Finish if more_regions => State::Start,
        State::Finish => State::Exit,
        State::Exit => State::Init,
    }
}

/// Progress and completion callbacks; every method defaults to a no-op.
pub trait RunObserver {
    fn state_changed(&mut self, _state: State) {}
    fn progress(&mut self, _ea: u64) {}
    fn unexpected_tail(&mut self, _finding: &TailFinding) {}
    fn finished(&mut self, _report: &RunReport) {}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("No passes selected")]
    NoPassesSelected,
    #[error("No functions in the database")]
    NoFunctions,
    #[error("Database is still analysing; wait for it to go idle before running")]
    NotIdle,
    #[error("No code segment found to process")]
    NoCodeRegion,
    #[error("Unknown segment: {0}")]
    UnknownRegion(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassTiming {
    pub pass: Pass,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionReport {
    pub region: Region,
    pub counters: PassCounters,
    pub timings: Vec<PassTiming>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// RFC 3339 timestamp of the run start.
    pub started_at: String,
    pub outcome: RunOutcome,
    pub passes: PassSelection,
    pub start_function_count: usize,
    pub end_function_count: usize,
    pub function_delta: i64,
    pub totals: PassCounters,
    pub regions: Vec<RegionReport>,
    pub unexpected_tails: Vec<TailFinding>,
    pub elapsed_ms: u64,
}

/// Drives the passes over a database.
#[derive(Debug, Clone, Default)]
pub struct CleanupRunner {
    config: CleanupConfig,
    cancel: CancelToken,
}

impl CleanupRunner {
    pub fn new(config: CleanupConfig) -> Self {
        Self { config, cancel: CancelToken::new() }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Token that stops the run at the next checkpoint.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Regions to process, in order.
    pub fn resolve_regions(&self, db: &dyn AnalysisDb) -> Result<VecDeque<Region>, RunError> {
        let segments = db.segments();
        if self.config.regions.is_empty() {
            return segments
                .iter()
                .find(|s| s.class == SegmentClass::Code)
                .map(|s| VecDeque::from([Region::from(s)]))
                .ok_or(RunError::NoCodeRegion);
        }
        self.config
            .regions
            .iter()
            .map(|name| {
                segments
                    .iter()
                    .find(|s| &s.name == name)
                    .map(Region::from)
                    .ok_or_else(|| RunError::UnknownRegion(name.clone()))
            })
            .collect()
    }

    pub fn run(
        &self,
        db: &mut dyn AnalysisDb,
        observer: &mut dyn RunObserver,
    ) -> Result<RunReport, RunError> {
        let passes = self.config.passes;
        if !passes.any() {
            return Err(RunError::NoPassesSelected);
        }
        if !db.is_idle() {
            return Err(RunError::NotIdle);
        }
        let start_function_count = db.function_count();
        if start_function_count == 0 {
            return Err(RunError::NoFunctions);
        }
        let mut worklist = self.resolve_regions(db)?;
        let Some(first) = worklist.pop_front() else {
            return Err(RunError::NoCodeRegion);
        };

        info!("Starting function count: {}", pretty_number(start_function_count as u64));
        let started_at = Utc::now().to_rfc3339();
        let run_clock = Instant::now();
        let mut ctx = RunContext::new(&self.config, first, self.cancel.clone(), observer);
        let mut regions = Vec::new();
        let mut timings = Vec::new();
        let mut region_clock = Instant::now();
        let mut outcome = RunOutcome::Completed;

        let mut state = next_state(State::Init, &passes, !worklist.is_empty());
        ctx.state_changed(state);
        loop {
            if state != State::Exit && ctx.is_cancelled() {
                warn!(" - Canceled -");
                outcome = RunOutcome::Cancelled;
                if state != State::Start {
                    regions.push(region_report(&ctx, &mut timings, region_clock));
                }
                worklist.clear();
                state = State::Exit;
                ctx.state_changed(state);
                continue;
            }

            match state {
                State::Init => {}
                State::Start => {
                    let region = &ctx.region;
                    info!(
                        "Processing segment: \"{}\", address: 0x{:X}-0x{:X}, size: 0x{:X}",
                        region.name,
                        region.start,
                        region.end,
                        region.size()
                    );
                    region_clock = Instant::now();
                }
                State::Pass1 | State::Pass2 | State::Pass3 | State::Pass4 => {
                    if let Some(pass) = state.pass() {
                        info!("===== {} =====", pass.title());
                        let clock = Instant::now();
                        let result = run_pass(pass, db, &mut ctx);
                        let elapsed = clock.elapsed();
                        info!("Time: {}", format_duration(elapsed));
                        timings.push(PassTiming { pass, elapsed_ms: elapsed.as_millis() as u64 });
                        if result.is_err() {
                            // Stay put; the cancellation check above takes it from here.
                            continue;
                        }
                    }
                }
                State::Finish => {
                    regions.push(region_report(&ctx, &mut timings, region_clock));
                }
                State::Exit => break,
            }

            state = next_state(state, &passes, !worklist.is_empty());
            if state == State::Start {
                if let Some(next) = worklist.pop_front() {
                    ctx.begin_region(next);
                }
            }
            ctx.state_changed(state);
        }

        let end_function_count = db.function_count();
        let mut totals = PassCounters::default();
        for region in &regions {
            totals.accumulate(&region.counters);
        }
        let report = RunReport {
            started_at,
            outcome,
            passes,
            start_function_count,
            end_function_count,
            function_delta: end_function_count as i64 - start_function_count as i64,
            totals,
            regions,
            unexpected_tails: std::mem::take(&mut ctx.unexpected_tails),
            elapsed_ms: run_clock.elapsed().as_millis() as u64,
        };
        log_end_stats(&report, run_clock.elapsed());
        ctx.finished(&report);
        ctx.state_changed(next_state(State::Exit, &passes, false));
        Ok(report)
    }
}

fn run_pass(
    pass: Pass,
    db: &mut dyn AnalysisDb,
    ctx: &mut RunContext<'_>,
) -> Result<(), Cancelled> {
    match pass {
        Pass::StrayData => stray_data::run(db, ctx),
        Pass::Alignment => alignment::run(db, ctx),
        Pass::MissingCode => missing_code::run(db, ctx),
        Pass::FunctionGaps => function_gaps::run(db, ctx),
    }
}

fn region_report(
    ctx: &RunContext<'_>,
    timings: &mut Vec<PassTiming>,
    region_clock: Instant,
) -> RegionReport {
    RegionReport {
        region: ctx.region.clone(),
        counters: ctx.counters,
        timings: std::mem::take(timings),
        elapsed_ms: region_clock.elapsed().as_millis() as u64,
    }
}

fn log_end_stats(report: &RunReport, elapsed: Duration) {
    info!("Total time: {}", format_duration(elapsed));
    info!("Alignments: {}", pretty_number(report.totals.align_fixes));
    match report.function_delta {
        0 => info!(" Functions: 0"),
        delta => info!(
            " Functions: {}{}",
            if delta > 0 { '+' } else { '-' },
            pretty_number(delta.unsigned_abs())
        ),
    }
    if !report.unexpected_tails.is_empty() {
        info!("Unexpected tails: {}", report.unexpected_tails.len());
    }
}

/// `1234567` as `1,234,567`.
pub fn pretty_number(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Human readable duration: `850 ms`, `12.40 seconds`, `3.5 minutes`.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 1.0 {
        format!("{} ms", elapsed.as_millis())
    } else if secs < 60.0 {
        format!("{secs:.2} seconds")
    } else if secs < 3600.0 {
        format!("{:.1} minutes", secs / 60.0)
    } else {
        format!("{:.1} hours", secs / 3600.0)
    }
}
