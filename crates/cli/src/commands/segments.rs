use anyhow::{Context, Result};
use clap::Args;
use cleanpass_core::db::AnalysisDb;
use cleanpass_core::model::SegmentClass;
use serde::{Deserialize, Serialize};

use crate::commands::{display_name, open_database, BinaryArgs};

#[derive(Args, Debug, Clone)]
pub struct SegmentsArgs {
    #[command(flatten)]
    pub binary: BinaryArgs,

    /// Emit JSON instead of human-readable text.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// One row of the segment listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub name: String,
    pub class: SegmentClass,
    pub start: u64,
    pub end: u64,
    /// Functions the initial analysis found starting in this segment.
    pub functions: usize,
}

/// Segments of a loaded binary after the initial analysis.
pub fn segment_rows(db: &dyn AnalysisDb) -> Vec<SegmentRow> {
    let starts: Vec<u64> =
        (0..db.function_count()).filter_map(|i| db.function_by_index(i)).map(|f| f.start).collect();
    db.segments()
        .into_iter()
        .map(|s| SegmentRow {
            functions: starts.iter().filter(|&&ea| ea >= s.start && ea < s.end).count(),
            name: s.name,
            class: s.class,
            start: s.start,
            end: s.end,
        })
        .collect()
}

/// List the segments the `run` command can be pointed at.
pub fn segments_command(args: &SegmentsArgs) -> Result<()> {
    let (format, db) = open_database(&args.binary)?;
    let rows = segment_rows(&db);

    if args.json {
        let serialized =
            serde_json::to_string_pretty(&rows).context("Failed to serialize segments to JSON")?;
        println!("{}", serialized);
        return Ok(());
    }

    println!("Segments in {} ({:?}, {}):", display_name(&args.binary.binary), format, rows.len());
    if rows.is_empty() {
        println!("  (none)");
        return Ok(());
    }
    for row in rows {
        println!(
            "  - {:<12} [{}] 0x{:X}-0x{:X} size=0x{:X} functions={}",
            row.name,
            row.class.as_str(),
            row.start,
            row.end,
            row.end - row.start,
            row.functions
        );
    }
    Ok(())
}
