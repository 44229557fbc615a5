//! Pass 4: look for functions hiding between known ones.
//!
//! The function table is snapshotted once; for each adjacent pair the bytes
//! between the end of one and the start of the next are walked item by item.
//! Runs of code that start right after padding or data become function
//! candidates and go through [`attempt_function`].

use log::{debug, trace, warn};

use crate::analysis::classify;
use crate::analysis::context::{Cancelled, RunContext};
use crate::analysis::tail::{attempt_function, Attempt};
use crate::db::AnalysisDb;
use crate::model::FunctionInfo;

pub fn run(db: &mut dyn AnalysisDb, ctx: &mut RunContext<'_>) -> Result<(), Cancelled> {
    db.wait_idle();
    let functions: Vec<FunctionInfo> =
        (0..db.function_count()).filter_map(|i| db.function_by_index(i)).collect();
    let region = ctx.region.clone();
    let pairs: Vec<(u64, u64)> = functions
        .windows(2)
        .filter(|pair| region.contains(pair[0].start) && region.contains(pair[1].start))
        .map(|pair| (pair[0].end, pair[1].start))
        .collect();
    ctx.counters.func_count = pairs.len() as u64;

    for (gap_start, gap_end) in pairs {
        ctx.counters.func_index += 1;
        if ctx.is_cancelled() {
            return Err(Cancelled);
        }
        if gap_end > gap_start {
            walk_gap(db, ctx, gap_start, gap_end - gap_start)?;
        }
    }
    Ok(())
}

/// Walk `[start, start + size)` and carve functions out of the code found
/// there.
pub fn walk_gap(
    db: &mut dyn AnalysisDb,
    ctx: &mut RunContext<'_>,
    start: u64,
    size: u64,
) -> Result<(), Cancelled> {
    db.wait_idle();
    let Some(end) = trimmed_end(db, start, start + size) else {
        trace!("0x{start:X}: gap is all padding");
        return Ok(());
    };
    debug!("gap 0x{start:X}-0x{end:X}");

    let mut span: Option<u64> = None;
    let mut ea = start;
    loop {
        ctx.checkpoint(ea)?;
        if ea < start || ea > end {
            warn!("0x{ea:X}: left gap 0x{start:X}-0x{end:X}, giving up on it");
            ctx.counters.gaps_aborted += 1;
            return Ok(());
        }
        if ea == end {
            break;
        }

        let flags = db.flags(ea);
        if classify::is_padding(&flags) || classify::is_data(&flags) {
            if let Some(code_start) = span.take() {
                if let Attempt::Covered { resume_at } = attempt_function(db, ctx, code_start) {
                    ea = resume_at;
                }
            }
        } else if classify::is_code(&flags) {
            if span.is_none() {
                span = Some(ea);
                if let Attempt::Covered { resume_at } = attempt_function(db, ctx, ea) {
                    span = None;
                    ea = resume_at;
                }
            }
        } else if classify::is_unknown(&flags) {
            span = None;
        } else {
            trace!("0x{ea:X}: unclassifiable item in gap");
            span = None;
        }

        db.wait_idle();
        // A function carved past the trimmed end is caught by the bounds check.
        if ea >= end {
            continue;
        }
        match db.next_head(ea, end) {
            Some(next) => ea = next,
            None => break,
        }
    }

    if let Some(code_start) = span {
        attempt_function(db, ctx, code_start);
    }
    Ok(())
}

/// Gap end with trailing padding cut off, or `None` when the gap is nothing
/// but padding.
fn trimmed_end(db: &dyn AnalysisDb, start: u64, end: u64) -> Option<u64> {
    let mut ea = db.prev_head(end, start)?;
    loop {
        if !classify::is_padding(&db.flags(ea)) {
            return Some(db.next_head(ea, end).unwrap_or(end));
        }
        ea = db.prev_head(ea, start)?;
    }
}
