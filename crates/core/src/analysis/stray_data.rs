//! Pass 1: turn data items stranded inside code back into unknown bytes so the
//! later passes can reconsider them as padding or instructions.

use log::{debug, trace};

use crate::analysis::classify;
use crate::analysis::context::{Cancelled, RunContext};
use crate::analysis::cursor::{Cursor, Visit};
use crate::db::AnalysisDb;

pub fn run(db: &mut dyn AnalysisDb, ctx: &mut RunContext<'_>) -> Result<(), Cancelled> {
    for sweep in 0..ctx.config.stray_data_sweeps {
        let changed = sweep_once(db, ctx)?;
        ctx.counters.pass1_loop_count += 1;
        debug!(
            "sweep {}: {} changed, unknowns so far {}",
            sweep + 1,
            changed,
            ctx.counters.unknown_data_count
        );
        if changed == 0 && ctx.config.stop_sweeps_at_fixpoint {
            break;
        }
    }
    Ok(())
}

/// One scan over the region; returns how many items were changed.
fn sweep_once(db: &mut dyn AnalysisDb, ctx: &mut RunContext<'_>) -> Result<u64, Cancelled> {
    let end = ctx.region.end;
    let mut cursor = Cursor::new(ctx.region.start, end);
    let mut changed = 0;

    db.wait_idle();
    let mut next = db.find_next(cursor.current(), end, &classify::is_data);
    while let Some(ea) = next {
        ctx.checkpoint(ea)?;
        if cursor.visit(ea) == Visit::Revisit {
            next = db.find_next(cursor.current(), end, &classify::is_data);
            continue;
        }

        // An item running off the region end is handled once and ends the sweep.
        let (item_end, last) = match db.next_head(ea, end) {
            Some(head) => (head, false),
            None => (end, true),
        };

        let flags = db.flags(ea);
        if classify::has_offset_reference(&flags) {
            trace!("0x{ea:X}: offset data kept");
        } else if classify::has_reference(&flags) && loaded_as_bytes(db, ea) {
            if !db.is_byte_array(ea) {
                db.make_unknown(ea, item_end);
                if db.make_byte_array(ea, item_end - ea) {
                    ctx.counters.byte_tables += 1;
                    changed += 1;
                }
                db.wait_idle();
            }
        } else {
            trace!("0x{ea:X}-0x{item_end:X}: data to unknown");
            db.make_unknown(ea, item_end);
            db.wait_idle();
            ctx.counters.unknown_data_count += 1;
            changed += 1;
        }

        if last {
            cursor.finish();
        } else {
            cursor.seek(item_end);
        }
        if cursor.is_exhausted() {
            break;
        }
        next = db.find_next(cursor.current(), end, &classify::is_data);
    }
    Ok(changed)
}

/// The first data reference to `ea` comes from code doing a byte-sized load.
fn loaded_as_bytes(db: &dyn AnalysisDb, ea: u64) -> bool {
    db.first_dref_to(ea)
        .filter(|&src| classify::is_code(&db.flags(src)))
        .and_then(|src| db.decode(src))
        .is_some_and(|insn| insn.is_byte_load())
}
