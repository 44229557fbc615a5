//! Pass 2: recover padding runs (`int3` / `nop` fill) as alignment items.

use log::{debug, trace};

use crate::analysis::classify;
use crate::analysis::context::{Cancelled, RunContext};
use crate::analysis::cursor::{Cursor, Visit};
use crate::db::AnalysisDb;

pub fn run(db: &mut dyn AnalysisDb, ctx: &mut RunContext<'_>) -> Result<(), Cancelled> {
    let end = ctx.region.end;
    let alignment = ctx.config.alignment.max(1);
    let short_run_max = ctx.config.short_run_max;
    let mut cursor = Cursor::new(ctx.region.start, end);

    while let Some(start) = db.find_next(cursor.current(), end, &classify::is_free_align_byte) {
        ctx.checkpoint(start)?;
        if cursor.visit(start) == Visit::Revisit {
            continue;
        }
        let Some(value) = db.byte(start) else {
            cursor.seek(start + 1);
            continue;
        };

        let mut run_end = start + 1;
        while run_end < end && db.byte(run_end) == Some(value) {
            if cursor.visit(run_end) == Visit::Revisit {
                break;
            }
            run_end += 1;
        }
        cursor.seek(run_end);
        let len = run_end - start;

        if run_end % alignment != 0 {
            continue;
        }
        if len <= short_run_max && !has_padding_evidence(db, start, run_end) {
            trace!("0x{start:X}: {len} byte run without references, left alone");
            continue;
        }
        if classify::is_align_item(&db.flags(start)) && db.item_size(start) == len {
            continue;
        }

        db.make_unknown(start, run_end);
        let made = db.make_align(start, len);
        db.wait_idle();
        if made {
            ctx.counters.align_fixes += 1;
        } else {
            debug!("0x{start:X}: {len} byte align failed");
            ctx.counters.align_failures += 1;
        }
    }
    Ok(())
}

/// One-hop reference evidence that a short run really is padding: control
/// flow touching either side of it, or a data reference at its end that
/// points into (or comes from) code.
fn has_padding_evidence(db: &dyn AnalysisDb, start: u64, end: u64) -> bool {
    if db.first_cref_from(end).is_some() || db.first_cref_to(end).is_some() {
        return true;
    }
    if let Some(before) = start.checked_sub(1) {
        if db.first_cref_from(before).is_some() || db.first_cref_to(before).is_some() {
            return true;
        }
    }
    match db.first_dref_from(end) {
        Some(target) => classify::is_code(&db.flags(target)),
        None => db.first_dref_to(end).is_some_and(|source| classify::is_code(&db.flags(source))),
    }
}
