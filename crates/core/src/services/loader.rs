//! Binary loading: map an ELF or PE image (or a flat blob) into a
//! [`MemoryDb`] and seed it the way a disassembler's first analysis would.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use goblin::elf::header::{EM_386, EM_X86_64, ET_REL};
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_NOBITS};
use goblin::elf::sym::STT_OBJECT;
use goblin::pe::header::{COFF_MACHINE_X86, COFF_MACHINE_X86_64};
use goblin::pe::section_table::{IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE};
use goblin::{elf, pe, Object};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{AnalysisDb, MemoryDb, Segment};
use crate::model::SegmentClass;
use crate::services::backends::{capstone_version, CapstoneDecoder, DecoderError};

/// Where relocatable objects get laid out, since their sections have no address.
const RELOCATABLE_BASE: u64 = 0x1000;

/// Largest section the loader will materialize in memory.
pub const MAX_SECTION_SIZE: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse binary: {0}")]
    Parse(String),
    #[error("Unsupported binary: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Elf,
    Pe,
    Raw,
}

/// How to map a flat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOptions {
    pub base: u64,
    pub bits: u32,
    /// Entry point; defaults to the base.
    pub entry: Option<u64>,
}

/// A parsed image, ready to become a database.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub format: ImageFormat,
    pub bits: u32,
    pub entry: Option<u64>,
    pub segments: Vec<Segment>,
    pub names: BTreeMap<u64, String>,
    /// Known data items: `(address, size, is_offset)`.
    pub data: Vec<(u64, u64, bool)>,
    pub function_starts: Vec<u64>,
}

impl LoadedImage {
    fn new(format: ImageFormat, bits: u32) -> Self {
        Self {
            format,
            bits,
            entry: None,
            segments: Vec::new(),
            names: BTreeMap::new(),
            data: Vec::new(),
            function_starts: Vec::new(),
        }
    }

    fn in_code(&self, ea: u64) -> bool {
        self.segments
            .iter()
            .any(|s| s.class == SegmentClass::Code && ea >= s.start && ea < s.end())
    }

    fn push_segment(&mut self, segment: Segment) {
        if segment.bytes.is_empty() {
            return;
        }
        let overlaps =
            self.segments.iter().any(|s| segment.start < s.end() && s.start < segment.end());
        if overlaps {
            debug!("skipping overlapping section {} at 0x{:X}", segment.name, segment.start);
            return;
        }
        self.segments.push(segment);
    }

    /// Build a capstone-backed database and run the seeding analysis.
    pub fn into_db(self) -> Result<MemoryDb, LoadError> {
        let decoder = CapstoneDecoder::new(self.bits)?;
        debug!("capstone {} decoding {}-bit code", capstone_version(), self.bits);
        let mut db = MemoryDb::new(Box::new(decoder));
        for segment in self.segments {
            db.add_segment(segment);
        }
        for (ea, name) in self.names {
            db.set_name(ea, name);
        }
        for (ea, len, offset) in self.data {
            db.make_data(ea, len, offset);
        }
        let mut starts = self.function_starts;
        starts.extend(self.entry);
        starts.sort_unstable();
        starts.dedup();
        seed(&mut db, &starts);
        info!(
            "Loaded {} segments, {} functions after initial analysis",
            db.segments().len(),
            db.function_count()
        );
        Ok(db)
    }
}

/// Decode and create functions at the given starts, letting the database's
/// background analysis follow calls and jumps.
pub fn seed(db: &mut dyn AnalysisDb, starts: &[u64]) {
    for &ea in starts {
        db.create_insn(ea);
    }
    db.wait_idle();
    for &ea in starts {
        db.add_function(ea);
    }
    db.wait_idle();
}

pub fn load_file(path: &Path, raw: Option<&RawOptions>) -> Result<LoadedImage, LoadError> {
    let bytes =
        fs::read(path).map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?;
    match raw {
        Some(options) => Ok(raw_image(&bytes, options)),
        None => parse_image(&bytes),
    }
}

/// Map a flat blob as a single code segment.
pub fn raw_image(bytes: &[u8], options: &RawOptions) -> LoadedImage {
    let mut image = LoadedImage::new(ImageFormat::Raw, options.bits);
    image.push_segment(Segment::new(".text", SegmentClass::Code, options.base, bytes.to_vec()));
    image.entry = Some(options.entry.unwrap_or(options.base));
    image
}

pub fn parse_image(bytes: &[u8]) -> Result<LoadedImage, LoadError> {
    match Object::parse(bytes).map_err(|e| LoadError::Parse(e.to_string()))? {
        Object::Elf(elf) => elf_image(&elf, bytes),
        Object::PE(pe) => pe_image(&pe, bytes),
        _ => Err(LoadError::Unsupported("only ELF and PE images are supported".into())),
    }
}

fn elf_image(elf: &elf::Elf, bytes: &[u8]) -> Result<LoadedImage, LoadError> {
    let bits = match elf.header.e_machine {
        EM_386 => 32,
        EM_X86_64 => 64,
        other => return Err(LoadError::Unsupported(format!("ELF machine {other}"))),
    };
    let mut image = LoadedImage::new(ImageFormat::Elf, bits);
    let relocatable = elf.header.e_type == ET_REL;

    // Section index -> load address.
    let mut bases: BTreeMap<usize, u64> = BTreeMap::new();
    let mut next_base = RELOCATABLE_BASE;
    for (index, sh) in elf.section_headers.iter().enumerate() {
        if sh.sh_flags & u64::from(SHF_ALLOC) == 0 || sh.sh_size == 0 {
            continue;
        }
        let len = section_len(sh.sh_size, index)?;
        let start = if relocatable {
            let align = sh.sh_addralign.max(1);
            let start = next_base.div_ceil(align) * align;
            next_base = start + sh.sh_size;
            start
        } else {
            sh.sh_addr
        };
        let data = if sh.sh_type == SHT_NOBITS {
            vec![0; len]
        } else {
            sh.file_range().and_then(|range| bytes.get(range)).map(<[u8]>::to_vec).ok_or_else(
                || LoadError::Parse(format!("section {index} lies outside the file")),
            )?
        };
        let class = if sh.sh_flags & u64::from(SHF_EXECINSTR) != 0 {
            SegmentClass::Code
        } else {
            SegmentClass::Data
        };
        let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
        bases.insert(index, start);
        image.push_segment(Segment::new(name, class, start, data));
    }

    for sym in elf.syms.iter() {
        let Some(&base) = bases.get(&sym.st_shndx) else {
            continue;
        };
        let address = if relocatable { base + sym.st_value } else { sym.st_value };
        let name = elf.strtab.get_at(sym.st_name).unwrap_or("");
        if !name.is_empty() {
            image.names.insert(address, name.to_string());
        }
        if sym.is_function() && image.in_code(address) {
            image.function_starts.push(address);
        } else if sym.st_type() == STT_OBJECT && sym.st_size > 0 {
            image.data.push((address, sym.st_size, false));
        }
    }

    if !relocatable && elf.entry != 0 && image.in_code(elf.entry) {
        image.entry = Some(elf.entry);
    }
    Ok(image)
}

fn section_len(size: u64, section: impl std::fmt::Display) -> Result<usize, LoadError> {
    if size > MAX_SECTION_SIZE {
        return Err(LoadError::Parse(format!(
            "section {section} is 0x{size:X} bytes, over the 0x{MAX_SECTION_SIZE:X} byte limit"
        )));
    }
    usize::try_from(size).map_err(|_| LoadError::Parse(format!("section {section} is too large")))
}

fn pe_image(pe: &pe::PE, bytes: &[u8]) -> Result<LoadedImage, LoadError> {
    let bits = match pe.header.coff_header.machine {
        COFF_MACHINE_X86 => 32,
        COFF_MACHINE_X86_64 => 64,
        other => return Err(LoadError::Unsupported(format!("PE machine 0x{other:X}"))),
    };
    let mut image = LoadedImage::new(ImageFormat::Pe, bits);
    let image_base = pe.image_base as u64;

    for sec in &pe.sections {
        let size = if sec.virtual_size == 0 { sec.size_of_raw_data } else { sec.virtual_size };
        let raw_len = sec.size_of_raw_data.min(size) as usize;
        let raw_start = sec.pointer_to_raw_data as usize;
        let mut data =
            bytes.get(raw_start..raw_start + raw_len).map(<[u8]>::to_vec).unwrap_or_default();
        data.resize(section_len(u64::from(size), sec.name().unwrap_or("?"))?, 0);
        let class = if sec.characteristics & (IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE) != 0 {
            SegmentClass::Code
        } else {
            SegmentClass::Data
        };
        let name = sec.name().unwrap_or("").to_string();
        image.push_segment(Segment::new(
            name,
            class,
            image_base + u64::from(sec.virtual_address),
            data,
        ));
    }

    for export in &pe.exports {
        if export.rva == 0 {
            continue;
        }
        let address = image_base + export.rva as u64;
        if let Some(name) = export.name.filter(|n| !n.is_empty()) {
            image.names.insert(address, name.to_string());
        }
        if image.in_code(address) {
            image.function_starts.push(address);
        }
    }

    // Import address table slots hold resolved pointers.
    let slot = if pe.is_64 { 8 } else { 4 };
    for import in &pe.imports {
        let address = image_base + import.rva as u64;
        image.names.insert(address, import.name.to_string());
        image.data.push((address, slot, true));
    }

    let entry = image_base + pe.entry as u64;
    if pe.entry != 0 && image.in_code(entry) {
        image.entry = Some(entry);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_images_default_entry_to_base() {
        let image = raw_image(&[0x55, 0xC3], &RawOptions { base: 0x400000, bits: 32, entry: None });
        assert_eq!(image.format, ImageFormat::Raw);
        assert_eq!(image.entry, Some(0x400000));
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].class, SegmentClass::Code);
    }

    #[test]
    fn oversized_sections_are_refused() {
        assert_eq!(section_len(0x10, ".text").unwrap(), 0x10);
        assert!(matches!(section_len(MAX_SECTION_SIZE + 1, ".bss"), Err(LoadError::Parse(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_image(b"definitely not an executable").is_err());
    }

    #[test]
    fn overlapping_sections_are_dropped() {
        let mut image = LoadedImage::new(ImageFormat::Raw, 32);
        image.push_segment(Segment::new("a", SegmentClass::Code, 0x1000, vec![0; 0x10]));
        image.push_segment(Segment::new("b", SegmentClass::Data, 0x1008, vec![0; 0x10]));
        image.push_segment(Segment::new("c", SegmentClass::Data, 0x1010, vec![0; 0x10]));
        let names: Vec<_> = image.segments.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn seeding_a_raw_image_finds_the_entry_function() {
        // push ebp; mov ebp, esp; pop ebp; ret
        let image = raw_image(
            &[0x55, 0x8B, 0xEC, 0x5D, 0xC3],
            &RawOptions { base: 0x401000, bits: 32, entry: None },
        );
        let db = image.into_db().unwrap();
        assert_eq!(db.function_count(), 1);
        let func = db.function_by_index(0).unwrap();
        assert_eq!((func.start, func.end), (0x401000, 0x401005));
    }
}
