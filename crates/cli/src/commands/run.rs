use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Args;
use cleanpass_core::analysis::CancelToken;
use cleanpass_core::config::{load_config, CleanupConfig, Pass};
use cleanpass_core::services::loader::ImageFormat;
use cleanpass_core::services::pipeline::{pretty_number, RunOutcome, State};
use cleanpass_core::{CleanupRunner, RunObserver, RunReport};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::commands::{display_name, open_database, BinaryArgs};
use crate::sha256_file;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub binary: BinaryArgs,

    /// YAML or JSON run configuration.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Segment to process (repeatable, processed in order). Defaults to the first code segment.
    #[arg(long = "segment")]
    pub segments: Vec<String>,

    /// Skip the stray data pass.
    #[arg(long, default_value_t = false)]
    pub skip_data: bool,

    /// Skip the alignment pass.
    #[arg(long, default_value_t = false)]
    pub skip_align: bool,

    /// Skip the missing code pass.
    #[arg(long, default_value_t = false)]
    pub skip_code: bool,

    /// Skip the function gap pass.
    #[arg(long, default_value_t = false)]
    pub skip_functions: bool,

    /// Number of stray data sweeps.
    #[arg(long)]
    pub sweeps: Option<u32>,

    /// Cancel the run after this many seconds; the partial report is still printed.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Write the JSON report to this file as well.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Emit JSON instead of human-readable text.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Everything a run produced, plus where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub tool_version: String,
    pub binary: String,
    pub sha256: String,
    pub format: ImageFormat,
    pub generated_at: String,
    pub run: RunReport,
}

/// Logs state transitions; progress ticks are too chatty for anything but trace.
#[derive(Debug, Default)]
struct LogObserver {
    last: Option<State>,
}

impl RunObserver for LogObserver {
    fn state_changed(&mut self, state: State) {
        if self.last != Some(state) {
            debug!("state: {:?}", state);
            self.last = Some(state);
        }
    }

    fn progress(&mut self, ea: u64) {
        trace!("at 0x{ea:X}");
    }
}

/// Cancel `token` once `after` has elapsed. A zero timeout cancels up front.
fn arm_timeout(token: CancelToken, after: Duration) {
    if after.is_zero() {
        token.cancel();
        return;
    }
    thread::spawn(move || {
        thread::sleep(after);
        debug!("timeout of {:?} reached, cancelling", after);
        token.cancel();
    });
}

/// Config file (or defaults) with command-line overrides applied.
pub fn build_config(args: &RunArgs) -> Result<CleanupConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => CleanupConfig::default(),
    };
    if !args.segments.is_empty() {
        config.regions = args.segments.clone();
    }
    for (pass, skip) in [
        (Pass::StrayData, args.skip_data),
        (Pass::Alignment, args.skip_align),
        (Pass::MissingCode, args.skip_code),
        (Pass::FunctionGaps, args.skip_functions),
    ] {
        if skip {
            config.passes.set(pass, false);
        }
    }
    if let Some(sweeps) = args.sweeps {
        config.stray_data_sweeps = sweeps;
    }
    config.validate()?;
    Ok(config)
}

/// Load the binary, run the cleanup passes and report what changed.
pub fn run_command(args: &RunArgs) -> Result<()> {
    let config = build_config(args)?;
    let (format, mut db) = open_database(&args.binary)?;
    let sha256 = sha256_file(&args.binary.binary)?;

    let runner = CleanupRunner::new(config);
    if let Some(secs) = args.timeout {
        arm_timeout(runner.cancel_token(), Duration::from_secs(secs));
    }
    let mut observer = LogObserver::default();
    let run = runner
        .run(&mut db, &mut observer)
        .map_err(|e| anyhow!("Cleanup run failed: {e}"))?;

    let report = CleanupReport {
        tool_version: cleanpass_core::version().to_string(),
        binary: args.binary.binary.display().to_string(),
        sha256,
        format,
        generated_at: Utc::now().to_rfc3339(),
        run,
    };

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
    }

    if args.json {
        let serialized =
            serde_json::to_string_pretty(&report).context("Failed to serialize report to JSON")?;
        println!("{}", serialized);
    } else {
        print_report(&report, &display_name(&args.binary.binary));
    }
    Ok(())
}

fn print_report(report: &CleanupReport, name: &str) {
    let run = &report.run;
    println!("Cleanup run: {name}");
    println!("  SHA-256: {}", report.sha256);
    println!("  Format: {:?}", report.format);
    println!(
        "  Outcome: {}",
        match run.outcome {
            RunOutcome::Completed => "completed",
            RunOutcome::Cancelled => "cancelled",
        }
    );
    println!(
        "  Functions: {} -> {} ({:+})",
        pretty_number(run.start_function_count as u64),
        pretty_number(run.end_function_count as u64),
        run.function_delta
    );

    for region in &run.regions {
        let c = &region.counters;
        println!(
            "  - {} [0x{:X}-0x{:X}] {} ms",
            region.region.name, region.region.start, region.region.end, region.elapsed_ms
        );
        println!(
            "      data reclaimed: {}, byte tables: {}, sweeps: {}",
            c.unknown_data_count, c.byte_tables, c.pass1_loop_count
        );
        println!("      alignments: {} (failed {})", c.align_fixes, c.align_failures);
        println!("      code: {} (misses {})", c.code_fixes, c.code_misses);
        println!(
            "      functions: +{} over {}/{} gaps (aborted {})",
            c.functions_created, c.func_index, c.func_count, c.gaps_aborted
        );
    }

    if run.unexpected_tails.is_empty() {
        return;
    }
    println!("Unexpected tails ({}):", run.unexpected_tails.len());
    for tail in &run.unexpected_tails {
        println!("  - 0x{:X} in {} (0x{:X})", tail.address, tail.name, tail.function_start);
    }
}
