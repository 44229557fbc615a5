//! Function attempts and the tail classifier.
//!
//! A freshly carved function is judged by its last instruction. Returns,
//! jumps, lone padding instructions and calls into exit/exception routines
//! are what real functions end with; anything else is reported so a human can
//! take a look. Nothing is ever rolled back.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::analysis::context::RunContext;
use crate::db::AnalysisDb;
use crate::model::{FunctionInfo, InsnKind};

/// Closed classification of a function's last instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailKind {
    Return,
    /// Unconditional jump, or a conditional branch into another chunk.
    Jump,
    /// A single `nop`/`int3` that was wrongly turned into a function.
    Padding,
    /// Call into a routine whose name marks it as never returning.
    NoReturnCall,
    Other,
    Undecodable,
}

impl TailKind {
    pub fn is_expected(self, function_no_return: bool) -> bool {
        match self {
            TailKind::Return | TailKind::Jump | TailKind::Padding | TailKind::NoReturnCall => true,
            TailKind::Other => function_no_return,
            TailKind::Undecodable => false,
        }
    }
}

/// A function whose tail did not look like a function end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailFinding {
    pub address: u64,
    pub function_start: u64,
    pub name: String,
}

/// Outcome of [`attempt_function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Failed,
    /// A function now covers the code start; scanning resumes after `resume_at`.
    Covered { resume_at: u64 },
}

/// Classify the instruction at `tail`, the last one of `func`.
pub fn classify_tail(
    db: &dyn AnalysisDb,
    tail: u64,
    func: &FunctionInfo,
    exit_fragments: &[String],
) -> TailKind {
    let Some(insn) = db.decode(tail) else {
        return TailKind::Undecodable;
    };
    match insn.kind {
        InsnKind::Return
        | InsnKind::InterruptReturn
        | InsnKind::SystemReturn
        | InsnKind::SystemCall => TailKind::Return,
        InsnKind::Jump | InsnKind::ConditionalJump => TailKind::Jump,
        InsnKind::Nop | InsnKind::Trap if tail == func.start => TailKind::Padding,
        InsnKind::Call if calls_exit_routine(db, tail, exit_fragments) => TailKind::NoReturnCall,
        _ => TailKind::Other,
    }
}

fn calls_exit_routine(db: &dyn AnalysisDb, call: u64, exit_fragments: &[String]) -> bool {
    let Some(name) = db.first_cref_from(call).and_then(|target| db.name_at(target)) else {
        return false;
    };
    let name = name.to_lowercase();
    exit_fragments.iter().any(|fragment| name.contains(&fragment.to_lowercase()))
}

/// Try to put a function at `code_start`.
pub fn attempt_function(
    db: &mut dyn AnalysisDb,
    ctx: &mut RunContext<'_>,
    code_start: u64,
) -> Attempt {
    db.wait_idle();
    if let Some(chunk) = db.function_chunk(code_start) {
        debug!("0x{code_start:X}: already inside function 0x{:X}", chunk.start);
        let resume_at = db.prev_head(chunk.end, code_start).unwrap_or(code_start);
        return Attempt::Covered { resume_at };
    }

    if !db.add_function(code_start) {
        debug!("0x{code_start:X}: function creation failed");
        return Attempt::Failed;
    }
    db.wait_idle();
    let Some(func) = db.function_chunk(code_start) else {
        return Attempt::Failed;
    };

    let Some(tail) = db.prev_head(func.end, code_start) else {
        ctx.counters.functions_created += 1;
        return Attempt::Covered { resume_at: code_start };
    };
    let kind = classify_tail(db, tail, &func, &ctx.config.exit_name_fragments);
    debug!("0x{code_start:X}: new function, tail 0x{tail:X} {kind:?}");

    if kind == TailKind::Padding {
        reclaim_padding(db, tail);
        return Attempt::Covered { resume_at: tail };
    }
    ctx.counters.functions_created += 1;
    if !kind.is_expected(func.no_return) {
        let name = db.name_at(func.start).unwrap_or_else(|| "unknown".to_string());
        ctx.report_tail(TailFinding { address: tail, function_start: func.start, name });
    }
    Attempt::Covered { resume_at: tail }
}

/// Turn a lone padding instruction back into an alignment item, or at least
/// leave it decoded.
fn reclaim_padding(db: &mut dyn AnalysisDb, tail: u64) {
    let size = db.item_size(tail).max(1);
    db.make_unknown(tail, tail + size);
    if !db.make_align(tail, size) {
        db.create_insn(tail);
    }
    db.wait_idle();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expectation_table() {
        assert!(TailKind::Return.is_expected(false));
        assert!(TailKind::Jump.is_expected(false));
        assert!(TailKind::Padding.is_expected(false));
        assert!(TailKind::NoReturnCall.is_expected(false));
        assert!(!TailKind::Other.is_expected(false));
        assert!(TailKind::Other.is_expected(true));
        assert!(!TailKind::Undecodable.is_expected(true));
    }
}
