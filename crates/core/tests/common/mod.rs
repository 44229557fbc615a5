//! Shared fixtures: small 32-bit x86 images built byte by byte.

#![allow(dead_code)]

use cleanpass_core::analysis::NullObserver;
use cleanpass_core::db::{AnalysisDb, MemoryDb, Segment};
use cleanpass_core::model::SegmentClass;
use cleanpass_core::services::backends::CapstoneDecoder;
use cleanpass_core::services::loader::seed;
use cleanpass_core::{CleanupConfig, CleanupRunner, RunReport};

pub const BASE: u64 = 0x401000;

/// push ebp; mov ebp, esp; mov eax, [ebp+8]; add eax, [ebp+0xc]; add eax, 1;
/// inc eax; dec eax; pop ebp; ret
pub const ADD_FN: [u8; 16] =
    [0x55, 0x8B, 0xEC, 0x8B, 0x45, 0x08, 0x03, 0x45, 0x0C, 0x83, 0xC0, 0x01, 0x40, 0x48, 0x5D, 0xC3];

/// push ebp; mov ebp, esp; pop ebp; ret
pub const SHORT_FN: [u8; 5] = [0x55, 0x8B, 0xEC, 0x5D, 0xC3];

/// Concatenate byte pieces.
pub fn image(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

pub fn fill(value: u8, len: usize) -> Vec<u8> {
    vec![value; len]
}

/// Empty database with one code segment at [`BASE`].
pub fn text_db(bytes: Vec<u8>) -> MemoryDb {
    segments_db(vec![Segment::new(".text", SegmentClass::Code, BASE, bytes)])
}

pub fn segments_db(segments: Vec<Segment>) -> MemoryDb {
    segments_db_with_bits(32, segments)
}

pub fn segments_db_with_bits(bits: u32, segments: Vec<Segment>) -> MemoryDb {
    let decoder = CapstoneDecoder::new(bits).expect("capstone");
    let mut db = MemoryDb::new(Box::new(decoder));
    for segment in segments {
        db.add_segment(segment);
    }
    db
}

/// Code segment at [`BASE`] with functions seeded at `starts`.
pub fn seeded(bytes: Vec<u8>, starts: &[u64]) -> MemoryDb {
    let mut db = text_db(bytes);
    seed(&mut db, starts);
    db
}

/// Like [`seeded`], decoding 64-bit code.
pub fn seeded64(bytes: Vec<u8>, starts: &[u64]) -> MemoryDb {
    let mut db =
        segments_db_with_bits(64, vec![Segment::new(".text", SegmentClass::Code, BASE, bytes)]);
    seed(&mut db, starts);
    db
}

pub fn run_with(db: &mut MemoryDb, config: CleanupConfig) -> RunReport {
    CleanupRunner::new(config).run(db, &mut NullObserver).expect("run")
}

pub fn run_all(db: &mut MemoryDb) -> RunReport {
    run_with(db, CleanupConfig::default())
}

pub fn function_bounds(db: &MemoryDb) -> Vec<(u64, u64)> {
    (0..db.function_count())
        .filter_map(|i| db.function_by_index(i))
        .map(|f| (f.start, f.end))
        .collect()
}
