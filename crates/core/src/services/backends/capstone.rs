use capstone::arch::x86::{X86OpMem, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::{arch, prelude::*, Capstone};

use super::{insn_kind_from_mnemonic, DecoderError, InstructionDecoder};
use crate::model::{Insn, InsnKind, Operand, OperandKind};

/// x86 / x86-64 decoder on top of capstone.
pub struct CapstoneDecoder {
    cs: Capstone,
    bits: u32,
}

/// Capstone library version as `major.minor`.
pub fn capstone_version() -> String {
    let (major, minor) = Capstone::lib_version();
    format!("{major}.{minor}")
}

fn make_cs(bits: u32) -> Result<Capstone, DecoderError> {
    let mode = match bits {
        32 => arch::x86::ArchMode::Mode32,
        64 => arch::x86::ArchMode::Mode64,
        other => return Err(DecoderError::UnsupportedBits(other)),
    };
    Capstone::new()
        .x86()
        .mode(mode)
        .detail(true)
        .build()
        .map_err(|e| DecoderError::Init(format!("capstone init failed: {e}")))
}

impl CapstoneDecoder {
    pub fn new(bits: u32) -> Result<Self, DecoderError> {
        Ok(Self { cs: make_cs(bits)?, bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    fn truncate(&self, value: u64) -> u64 {
        if self.bits == 32 {
            value & 0xFFFF_FFFF
        } else {
            value
        }
    }

    /// Absolute address a memory operand names, if any.
    ///
    /// rip-relative operands resolve against the next instruction; anything
    /// else yields the displacement and the database decides whether it lands
    /// in the image.
    fn memory_target(&self, mem: &X86OpMem, next: u64) -> Option<u64> {
        let disp = mem.disp();
        let base = mem.base();
        if base.0 != 0 && self.cs.reg_name(base).as_deref() == Some("rip") {
            return Some(next.wrapping_add(disp as u64));
        }
        (disp != 0).then(|| self.truncate(disp as u64))
    }
}

impl InstructionDecoder for CapstoneDecoder {
    fn decode(&self, bytes: &[u8], address: u64) -> Option<Insn> {
        let insns = self.cs.disasm_count(bytes, address, 1).ok()?;
        let insn = insns.iter().next()?;
        let mnemonic = insn.mnemonic().unwrap_or("").to_string();
        let kind = insn_kind_from_mnemonic(&mnemonic);
        let size = insn.bytes().len() as u64;
        let next = address + size;
        let branches = matches!(kind, InsnKind::Jump | InsnKind::ConditionalJump | InsnKind::Call);

        let mut operands = Vec::new();
        let mut target = None;
        let mut mem_ref = None;
        if let Ok(detail) = self.cs.insn_detail(&insn) {
            for op in detail.arch_detail().operands() {
                let ArchOperand::X86Operand(op) = op else {
                    continue;
                };
                let op_size = op.size;
                match op.op_type {
                    X86OperandType::Reg(_) => {
                        operands.push(Operand { kind: OperandKind::Register, size: op_size })
                    }
                    X86OperandType::Imm(imm) => {
                        operands.push(Operand { kind: OperandKind::Immediate, size: op_size });
                        if branches {
                            target = Some(self.truncate(imm as u64));
                        }
                    }
                    X86OperandType::Mem(mem) => {
                        operands.push(Operand { kind: OperandKind::Memory, size: op_size });
                        mem_ref = mem_ref.or_else(|| self.memory_target(&mem, next));
                    }
                    _ => {}
                }
            }
        }

        Some(Insn { address, size, kind, mnemonic, operands, target, mem_ref })
    }

    fn name(&self) -> &'static str {
        "capstone"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> CapstoneDecoder {
        CapstoneDecoder::new(32).expect("capstone")
    }

    #[test]
    fn rejects_odd_widths() {
        assert!(matches!(CapstoneDecoder::new(16), Err(DecoderError::UnsupportedBits(16))));
    }

    #[test]
    fn decodes_prologue_and_return() {
        let cs = decoder();
        let push = cs.decode(&[0x55, 0x8B, 0xEC], 0x401000).expect("push");
        assert_eq!(push.size, 1);
        assert_eq!(push.kind, InsnKind::Other);
        let ret = cs.decode(&[0xC3], 0x401005).expect("ret");
        assert_eq!(ret.kind, InsnKind::Return);
        assert!(cs.decode(&[0xE8, 0x00], 0x401000).is_none(), "truncated call");
    }

    #[test]
    fn resolves_call_targets_and_byte_loads() {
        let cs = decoder();
        // call rel32 -> 0x401020
        let call = cs.decode(&[0xE8, 0x1B, 0x00, 0x00, 0x00], 0x401000).expect("call");
        assert_eq!(call.kind, InsnKind::Call);
        assert_eq!(call.target, Some(0x401020));

        // movzx eax, byte ptr [ecx + 0x401100]
        let load = cs.decode(&[0x0F, 0xB6, 0x81, 0x00, 0x11, 0x40, 0x00], 0x401000).expect("movzx");
        assert_eq!(load.kind, InsnKind::MovZx);
        assert!(load.is_byte_load());
        assert_eq!(load.mem_ref, Some(0x401100));
    }

    #[test]
    fn rip_relative_operands_resolve_in_long_mode() {
        let cs = CapstoneDecoder::new(64).expect("capstone");
        // mov rax, qword ptr [rip + 0x10]
        let insn = cs.decode(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00], 0x1000).expect("mov");
        assert_eq!(insn.kind, InsnKind::Mov);
        assert_eq!(insn.mem_ref, Some(0x1017));

        let syscall = cs.decode(&[0x0F, 0x05], 0x1007).expect("syscall");
        assert_eq!(syscall.kind, InsnKind::SystemCall);
        assert!(!syscall.kind.stops_flow());
    }
}
