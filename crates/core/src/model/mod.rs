//! Core data model shared by the database, the classifier and the passes.
//!
//! Everything here is a plain value: addresses, flag snapshots, decoded
//! instructions and function descriptors. The analysis database owns the real
//! state; these types are what it hands out.

use serde::{Deserialize, Serialize};

/// Closed classification of the item covering an address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Code,
    Data,
    #[default]
    Unknown,
    Alignment,
}

/// Snapshot of the database flags at a single address.
///
/// `value` is `None` for addresses with no loaded byte; such addresses are
/// unclassifiable. Unknown bytes are always heads of a one-byte item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub value: Option<u8>,
    pub kind: ItemKind,
    pub is_head: bool,
    /// Some code or data reference targets this address.
    pub has_xref: bool,
    /// The item at this head is tagged as an offset (a resolved pointer).
    pub is_offset: bool,
}

/// Segment class as reported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentClass {
    Code,
    Data,
}

impl SegmentClass {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentClass::Code => "CODE",
            SegmentClass::Data => "DATA",
        }
    }
}

/// Descriptor for a loaded segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    pub class: SegmentClass,
    pub start: u64,
    pub end: u64,
}

/// A contiguous `[start, end)` interval selected for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn new(name: impl Into<String>, start: u64, end: u64) -> Self {
        Self { name: name.into(), start, end }
    }

    pub fn contains(&self, ea: u64) -> bool {
        ea >= self.start && ea < self.end
    }

    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

impl From<&SegmentInfo> for Region {
    fn from(seg: &SegmentInfo) -> Self {
        Region::new(seg.name.clone(), seg.start, seg.end)
    }
}

/// Function (or function chunk) extent and attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub start: u64,
    pub end: u64,
    /// Execution never falls through back to a caller.
    pub no_return: bool,
}

/// The small opcode table the cleanup heuristics care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsnKind {
    /// `ret`, `retf` and friends.
    Return,
    /// `iret`, `iretd`, `iretq`.
    InterruptReturn,
    /// `sysret`, `sysexit`.
    SystemReturn,
    /// `syscall`, `sysenter`; execution resumes after the instruction.
    SystemCall,
    Jump,
    ConditionalJump,
    Call,
    Nop,
    /// Single-byte `int3` trap.
    Trap,
    Halt,
    Mov,
    MovZx,
    MovSx,
    Other,
}

impl InsnKind {
    /// Execution does not continue at the next address.
    pub fn stops_flow(self) -> bool {
        matches!(
            self,
            InsnKind::Return
                | InsnKind::InterruptReturn
                | InsnKind::SystemReturn
                | InsnKind::Jump
                | InsnKind::Trap
                | InsnKind::Halt
        )
    }

    pub fn is_return(self) -> bool {
        matches!(self, InsnKind::Return | InsnKind::InterruptReturn | InsnKind::SystemReturn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandKind {
    Register,
    Immediate,
    Memory,
}

/// Decoded operand: its kind and access size in bytes (0 when unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    pub size: u8,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insn {
    pub address: u64,
    pub size: u64,
    pub kind: InsnKind,
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    /// Direct branch or call destination.
    pub target: Option<u64>,
    /// Absolute (or rip-resolved) memory address referenced by an operand.
    pub mem_ref: Option<u64>,
}

impl Insn {
    pub fn end(&self) -> u64 {
        self.address + self.size
    }

    /// `movzx`/`movsx`, or a `mov` into a register from a byte-sized source.
    pub fn is_byte_load(&self) -> bool {
        match self.kind {
            InsnKind::MovZx | InsnKind::MovSx => true,
            InsnKind::Mov => matches!(
                self.operands.as_slice(),
                [Operand { kind: OperandKind::Register, .. }, Operand { size: 1, .. }, ..]
            ),
            _ => false,
        }
    }
}

/// Cross-reference flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XrefKind {
    Code,
    Data,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(kind: InsnKind, operands: Vec<Operand>) -> Insn {
        Insn {
            address: 0x1000,
            size: 3,
            kind,
            mnemonic: String::new(),
            operands,
            target: None,
            mem_ref: None,
        }
    }

    #[test]
    fn byte_load_detection() {
        let reg4 = Operand { kind: OperandKind::Register, size: 4 };
        let mem1 = Operand { kind: OperandKind::Memory, size: 1 };
        let mem4 = Operand { kind: OperandKind::Memory, size: 4 };

        assert!(insn(InsnKind::MovZx, vec![reg4, mem1]).is_byte_load());
        assert!(insn(InsnKind::MovSx, vec![reg4, mem1]).is_byte_load());
        assert!(insn(InsnKind::Mov, vec![reg4, mem1]).is_byte_load());
        assert!(!insn(InsnKind::Mov, vec![reg4, mem4]).is_byte_load());
        assert!(!insn(InsnKind::Mov, vec![mem1, reg4]).is_byte_load());
        assert!(!insn(InsnKind::Other, vec![reg4, mem1]).is_byte_load());
    }

    #[test]
    fn flow_stopping_kinds() {
        assert!(InsnKind::Return.stops_flow());
        assert!(InsnKind::Jump.stops_flow());
        assert!(InsnKind::Trap.stops_flow());
        assert!(!InsnKind::ConditionalJump.stops_flow());
        assert!(!InsnKind::Call.stops_flow());
        assert!(!InsnKind::Nop.stops_flow());
        assert!(!InsnKind::SystemCall.stops_flow());
        assert!(!InsnKind::SystemCall.is_return());
        assert!(InsnKind::SystemReturn.stops_flow());
    }
}
