#![cfg(feature = "capstone-backend")]

mod common;

use object::write::{Object, SectionId, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

use cleanpass_core::analysis::NullObserver;
use cleanpass_core::db::AnalysisDb;
use cleanpass_core::model::{ItemKind, SegmentClass};
use cleanpass_core::services::loader::{self, ImageFormat, LoadError, RawOptions};
use cleanpass_core::CleanupRunner;

use common::{fill, image, ADD_FN, SHORT_FN};

fn symbol(name: &str, value: u64, size: u64, kind: SymbolKind, section: SectionId) -> Symbol {
    Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size,
        kind,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::None,
    }
}

/// Relocatable i386 object: `add` and `leaf` in .text with nop fill between,
/// and a 4-byte `table` in .data.
fn elf_fixture() -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::I386, Endianness::Little);

    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &image(&[&ADD_FN, &fill(0x90, 16), &SHORT_FN]), 16);
    let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
    obj.append_section_data(data, &[1, 2, 3, 4], 4);

    obj.add_symbol(symbol("add", 0, 16, SymbolKind::Text, text));
    obj.add_symbol(symbol("leaf", 0x20, 5, SymbolKind::Text, text));
    obj.add_symbol(symbol("table", 0, 4, SymbolKind::Data, data));

    obj.write().expect("write elf")
}

#[test]
fn relocatable_elf_sections_get_a_synthetic_layout() {
    let image = loader::parse_image(&elf_fixture()).expect("parse elf");
    assert_eq!(image.format, ImageFormat::Elf);
    assert_eq!(image.bits, 32);
    assert_eq!(image.entry, None);

    let text = image.segments.iter().find(|s| s.name == ".text").expect(".text");
    assert_eq!(text.class, SegmentClass::Code);
    assert_eq!(text.start, 0x1000);
    assert_eq!(text.bytes.len(), 0x25);

    let data = image.segments.iter().find(|s| s.name == ".data").expect(".data");
    assert_eq!(data.class, SegmentClass::Data);
    assert!(data.start >= text.end());
    assert_eq!(data.start % 4, 0);

    assert!(image.function_starts.contains(&0x1000));
    assert!(image.function_starts.contains(&0x1020));
    assert_eq!(image.names.get(&0x1000).map(String::as_str), Some("add"));
    assert_eq!(image.names.get(&0x1020).map(String::as_str), Some("leaf"));
    assert!(image.data.contains(&(data.start, 4, false)));
}

#[test]
fn loaded_elf_is_seeded_and_cleaned() {
    let image = loader::parse_image(&elf_fixture()).expect("parse elf");
    let table = image.segments.iter().find(|s| s.name == ".data").map(|s| s.start).expect(".data");
    let mut db = image.into_db().expect("db");

    assert_eq!(db.function_count(), 2);
    assert_eq!(db.name_at(0x1000).as_deref(), Some("add"));
    assert_eq!(db.flags(table).kind, ItemKind::Data);
    assert_eq!(db.flags(0x1010).kind, ItemKind::Unknown);

    let report = CleanupRunner::default().run(&mut db, &mut NullObserver).expect("run");
    assert_eq!(report.regions.len(), 1);
    assert_eq!(report.regions[0].region.name, ".text");
    assert_eq!(report.totals.align_fixes, 1);
    assert_eq!(db.flags(0x1010).kind, ItemKind::Alignment);
    assert_eq!(db.flags(table).kind, ItemKind::Data, "data segments are not swept");
}

#[test]
fn files_are_read_from_disk() {
    let temp = tempfile::tempdir().expect("tempdir");
    let elf = temp.path().join("fixture.o");
    std::fs::write(&elf, elf_fixture()).expect("write");
    let image = loader::load_file(&elf, None).expect("load");
    assert_eq!(image.format, ImageFormat::Elf);

    let raw = temp.path().join("blob.bin");
    std::fs::write(&raw, SHORT_FN).expect("write");
    let options = RawOptions { base: 0x8000, bits: 32, entry: None };
    let image = loader::load_file(&raw, Some(&options)).expect("load raw");
    assert_eq!(image.format, ImageFormat::Raw);
    assert_eq!(image.entry, Some(0x8000));

    let missing = loader::load_file(&temp.path().join("missing"), None);
    assert!(matches!(missing, Err(LoadError::Io { .. })));
}

#[test]
fn non_x86_elf_is_unsupported() {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Aarch64, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0xC0, 0x03, 0x5F, 0xD6], 4);
    let bytes = obj.write().expect("write elf");

    assert!(matches!(loader::parse_image(&bytes), Err(LoadError::Unsupported(_))));
}

#[test]
fn huge_bss_is_a_parse_error() {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::I386, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &SHORT_FN, 16);
    let bss = obj.add_section(Vec::new(), b".bss".to_vec(), SectionKind::UninitializedData);
    obj.append_section_bss(bss, loader::MAX_SECTION_SIZE + 0x1000, 16);
    let bytes = obj.write().expect("write elf");

    match loader::parse_image(&bytes) {
        Err(LoadError::Parse(message)) => assert!(message.contains("limit"), "{message}"),
        other => panic!("expected a parse error, got {other:?}"),
    }
}

#[test]
fn raw_images_with_bad_widths_fail_to_open() {
    let image = loader::raw_image(&SHORT_FN, &RawOptions { base: 0, bits: 16, entry: None });
    assert!(matches!(image.into_db(), Err(LoadError::Decoder(_))));
}
