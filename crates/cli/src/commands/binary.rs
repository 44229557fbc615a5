use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Args;
use cleanpass_core::db::MemoryDb;
use cleanpass_core::services::loader::{self, ImageFormat, LoadedImage, RawOptions};

use crate::parse_address;

/// Where the binary comes from and, for flat files, how to map it.
#[derive(Args, Debug, Clone)]
pub struct BinaryArgs {
    /// Path to the ELF/PE image (or flat blob with `--raw`).
    #[arg(long)]
    pub binary: PathBuf,

    /// Treat the file as raw bytes mapped at `--base`.
    #[arg(long, default_value_t = false)]
    pub raw: bool,

    /// Load address for raw files (hex with 0x, or decimal).
    #[arg(long, value_parser = parse_address, default_value = "0x400000")]
    pub base: u64,

    /// Address width for raw files.
    #[arg(long, default_value_t = 32)]
    pub bits: u32,

    /// Entry point for raw files; defaults to the base.
    #[arg(long, value_parser = parse_address)]
    pub entry: Option<u64>,
}

impl BinaryArgs {
    pub fn raw_options(&self) -> Option<RawOptions> {
        self.raw.then_some(RawOptions { base: self.base, bits: self.bits, entry: self.entry })
    }
}

/// Parse the binary named by `args`.
pub fn load_image(args: &BinaryArgs) -> Result<LoadedImage> {
    if !args.binary.exists() {
        return Err(anyhow!("Binary file does not exist: {}", args.binary.display()));
    }
    let raw = args.raw_options();
    loader::load_file(&args.binary, raw.as_ref())
        .with_context(|| format!("Failed to load {}", args.binary.display()))
}

/// Parse the binary and build a seeded analysis database from it.
pub fn open_database(args: &BinaryArgs) -> Result<(ImageFormat, MemoryDb)> {
    let image = load_image(args)?;
    let format = image.format;
    let db = image.into_db().context("Failed to build analysis database")?;
    Ok((format, db))
}

/// File name for display, falling back to the full path.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|os| os.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}
