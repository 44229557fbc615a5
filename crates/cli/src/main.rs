use anyhow::Result;
use clap::{Parser, Subcommand};
use cleanpass::commands::{run_command, segments_command, RunArgs, SegmentsArgs};
use cleanpass::log_level;

/// Post-analysis cleanup for disassembled x86 binaries.
///
/// This CLI is a thin wrapper around `cleanpass-core`: it loads a binary,
/// runs the disassembler's initial analysis in memory, then runs the cleanup
/// passes over it and reports what they changed.
#[derive(Parser, Debug)]
#[command(
    name = "cleanpass",
    version,
    about = "Repair gaps left by automated disassembly",
    long_about = None
)]
struct Cli {
    /// More logging (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, default_value_t = false, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cleanup passes over a binary.
    ///
    /// Passes run in order over each selected segment:
    /// - Stray data: turn data items inside code back into unknown bytes.
    /// - Alignment: mark 0xCC/0x90 padding runs as alignment.
    /// - Missing code: decode unknown bytes as instructions.
    /// - Function gaps: create functions in the space between existing ones.
    Run(RunArgs),

    /// List the segments of a binary after initial analysis.
    Segments(SegmentsArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(log_level(cli.verbose, cli.quiet))
        .parse_default_env()
        .format_timestamp(None)
        .init();

    match cli.command {
        Command::Run(args) => run_command(&args)?,
        Command::Segments(args) => segments_command(&args)?,
    }

    Ok(())
}
