//! Instruction decoder backends.
//!
//! The analysis database delegates "what instruction lives at this address"
//! to an [`InstructionDecoder`]. Capstone is the only production backend; tests
//! plug in tiny table-driven decoders.

use thiserror::Error;

use crate::model::{Insn, InsnKind};

#[cfg(feature = "capstone-backend")]
pub mod capstone;

#[cfg(feature = "capstone-backend")]
pub use self::capstone::{capstone_version, CapstoneDecoder};

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("Unsupported address width: {0} bits (expected 32 or 64)")]
    UnsupportedBits(u32),
    #[error("Decoder initialisation failed: {0}")]
    Init(String),
}

/// Decodes a single instruction from the front of `bytes`.
pub trait InstructionDecoder {
    /// `None` when the bytes do not start with a valid instruction.
    fn decode(&self, bytes: &[u8], address: u64) -> Option<Insn>;
    fn name(&self) -> &'static str;
}

/// Map an x86 mnemonic onto the opcode classes the cleanup passes use.
pub fn insn_kind_from_mnemonic(mnemonic: &str) -> InsnKind {
    let m = mnemonic.trim().to_ascii_lowercase();
    match m.as_str() {
        "ret" | "retn" | "retf" | "retfq" => InsnKind::Return,
        "iret" | "iretd" | "iretq" => InsnKind::InterruptReturn,
        "sysret" | "sysretq" | "sysexit" | "sysexitq" => InsnKind::SystemReturn,
        "syscall" | "sysenter" => InsnKind::SystemCall,
        "jmp" | "ljmp" => InsnKind::Jump,
        "call" | "lcall" => InsnKind::Call,
        "nop" => InsnKind::Nop,
        "int3" => InsnKind::Trap,
        "hlt" => InsnKind::Halt,
        "mov" => InsnKind::Mov,
        "movzx" => InsnKind::MovZx,
        "movsx" | "movsxd" => InsnKind::MovSx,
        other if other.starts_with('j') => InsnKind::ConditionalJump,
        _ => InsnKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonic_table() {
        assert_eq!(insn_kind_from_mnemonic("ret"), InsnKind::Return);
        assert_eq!(insn_kind_from_mnemonic("RETF"), InsnKind::Return);
        assert_eq!(insn_kind_from_mnemonic("iretq"), InsnKind::InterruptReturn);
        assert_eq!(insn_kind_from_mnemonic("syscall"), InsnKind::SystemCall);
        assert_eq!(insn_kind_from_mnemonic("sysret"), InsnKind::SystemReturn);
        assert_eq!(insn_kind_from_mnemonic("jmp"), InsnKind::Jump);
        assert_eq!(insn_kind_from_mnemonic("jne"), InsnKind::ConditionalJump);
        assert_eq!(insn_kind_from_mnemonic("jrcxz"), InsnKind::ConditionalJump);
        assert_eq!(insn_kind_from_mnemonic("call"), InsnKind::Call);
        assert_eq!(insn_kind_from_mnemonic("int3"), InsnKind::Trap);
        assert_eq!(insn_kind_from_mnemonic("movsxd"), InsnKind::MovSx);
        assert_eq!(insn_kind_from_mnemonic("push"), InsnKind::Other);
    }
}
