//! Byte/item classifier: pure predicates over a [`Flags`] snapshot.

use crate::model::{Flags, ItemKind};

/// Raw byte values compilers emit as padding: `int3` and `nop`.
pub const ALIGN_BYTES: [u8; 2] = [0xCC, 0x90];

/// Head of a data item. Alignment items are their own kind and never match.
pub fn is_data(flags: &Flags) -> bool {
    flags.is_head && flags.kind == ItemKind::Data
}

/// Head of an instruction.
pub fn is_code(flags: &Flags) -> bool {
    flags.is_head && flags.kind == ItemKind::Code
}

/// Loaded byte that belongs to no item.
pub fn is_unknown(flags: &Flags) -> bool {
    flags.value.is_some() && flags.kind == ItemKind::Unknown
}

/// Head of an alignment item.
pub fn is_align_item(flags: &Flags) -> bool {
    flags.is_head && flags.kind == ItemKind::Alignment
}

/// Loaded byte whose value is in [`ALIGN_BYTES`], whatever item it belongs to.
/// Padding already decoded as `nop`/`int3` still counts.
pub fn is_align_byte(flags: &Flags) -> bool {
    flags.value.is_some_and(|v| ALIGN_BYTES.contains(&v))
}

/// Align byte nothing has claimed yet: unknown and unreferenced. Only these
/// are safe to fold into a new alignment item.
pub fn is_free_align_byte(flags: &Flags) -> bool {
    flags.kind == ItemKind::Unknown && !flags.has_xref && is_align_byte(flags)
}

/// Either an alignment item or a byte that looks like padding.
pub fn is_padding(flags: &Flags) -> bool {
    is_align_byte(flags) || is_align_item(flags)
}

pub fn has_reference(flags: &Flags) -> bool {
    flags.has_xref
}

pub fn has_offset_reference(flags: &Flags) -> bool {
    flags.is_offset
}

/// Closed classification; `None` means the address has no loaded byte.
pub fn classify(flags: &Flags) -> Option<ItemKind> {
    flags.value.map(|_| flags.kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(value: Option<u8>, kind: ItemKind, is_head: bool) -> Flags {
        Flags { value, kind, is_head, has_xref: false, is_offset: false }
    }

    #[test]
    fn data_and_code_require_heads() {
        assert!(is_data(&flags(Some(0), ItemKind::Data, true)));
        assert!(!is_data(&flags(Some(0), ItemKind::Data, false)));
        assert!(!is_data(&flags(Some(0), ItemKind::Alignment, true)));
        assert!(is_code(&flags(Some(0x55), ItemKind::Code, true)));
        assert!(!is_code(&flags(Some(0x55), ItemKind::Code, false)));
    }

    #[test]
    fn align_bytes_match_on_value_alone() {
        assert!(is_align_byte(&flags(Some(0xCC), ItemKind::Unknown, true)));
        assert!(is_align_byte(&flags(Some(0x90), ItemKind::Unknown, true)));
        assert!(is_align_byte(&flags(Some(0x90), ItemKind::Code, true)));
        assert!(is_padding(&flags(Some(0xCC), ItemKind::Code, true)));
        assert!(!is_align_byte(&flags(Some(0x00), ItemKind::Unknown, true)));
        assert!(!is_align_byte(&flags(None, ItemKind::Unknown, true)));
        assert!(is_padding(&flags(Some(0x00), ItemKind::Alignment, true)));
    }

    #[test]
    fn free_align_bytes_are_unclaimed() {
        assert!(is_free_align_byte(&flags(Some(0xCC), ItemKind::Unknown, true)));
        assert!(!is_free_align_byte(&flags(Some(0x90), ItemKind::Code, true)));
        let referenced = Flags { has_xref: true, ..flags(Some(0xCC), ItemKind::Unknown, true) };
        assert!(!is_free_align_byte(&referenced));
        assert!(!is_free_align_byte(&flags(Some(0x00), ItemKind::Unknown, true)));
    }

    #[test]
    fn unloaded_bytes_are_unclassifiable() {
        assert_eq!(classify(&flags(None, ItemKind::Unknown, true)), None);
        assert!(!is_unknown(&flags(None, ItemKind::Unknown, true)));
        assert_eq!(classify(&flags(Some(1), ItemKind::Data, true)), Some(ItemKind::Data));
    }
}
