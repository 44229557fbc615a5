//! Pass 3: try to decode an instruction at every byte still left unknown.

use log::trace;

use crate::analysis::context::{Cancelled, RunContext};
use crate::analysis::cursor::{Cursor, Visit};
use crate::db::AnalysisDb;

pub fn run(db: &mut dyn AnalysisDb, ctx: &mut RunContext<'_>) -> Result<(), Cancelled> {
    let end = ctx.region.end;
    let mut cursor = Cursor::new(ctx.region.start, end);

    while let Some(ea) = db.next_unknown(cursor.current(), end) {
        ctx.checkpoint(ea)?;
        if cursor.visit(ea) == Visit::Revisit {
            continue;
        }

        db.wait_idle();
        match db.create_insn(ea) {
            Some(_) => ctx.counters.code_fixes += 1,
            None => {
                trace!("0x{ea:X}: no instruction");
                ctx.counters.code_misses += 1;
            }
        }
        db.wait_idle();
        cursor.seek(ea + 1);
    }
    Ok(())
}
