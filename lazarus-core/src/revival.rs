use crate::config::{resolve_runtime_library, RevivalConfig};
use crate::error::{Error, Result};
use crate::image::{ElfImage, OpenMode};
use crate::mappings::{default_executable, write_mappings};
use crate::symbols::write_symbols;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Mapping descriptor inside a revival directory.
pub const MAPPINGS_FILE: &str = "core.mappings";

/// Symbol addresses of the relocated library inside a revival directory.
pub const SYMBOLS_FILE: &str = "symbols.txt";

/// What [`prepare_revival`] left in the revival directory.
#[derive(Debug, Clone)]
pub struct PreparedRevival {
    pub library: PathBuf,
    pub displacement: i64,
    pub segments: usize,
    pub symbols: usize,
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| Error::io(path, e))
}

/// Builds a revival directory for `core_path` in `out_dir`: a copy of the
/// runtime library moved to the address the core recorded for it, its symbol
/// file, and the core's mapping descriptor.
///
/// The load-bias gate is the caller's to check.
pub fn prepare_revival(
    core_path: &Path,
    out_dir: &Path,
    config: &RevivalConfig,
) -> Result<PreparedRevival> {
    let mut core = ElfImage::open(core_path, OpenMode::ReadOnly)?;
    let mapping = core.get_library_mapping(&config.runtime_library)?;
    let source = resolve_runtime_library(&mut core, config)?;

    fs::create_dir_all(out_dir).map_err(|e| Error::io(out_dir, e))?;
    let library = out_dir.join(mapping.os_file_name());
    fs::copy(&source, &library).map_err(|e| Error::io(&library, e))?;
    log::info!("Copied {} to {}", source.display(), library.display());

    let mut lib = ElfImage::open(&library, OpenMode::ReadWrite)?;
    let bias = lib
        .load_bias()
        .ok_or_else(|| Error::format(&library, "no PT_LOAD segments"))?;
    let base = mapping.start.wrapping_sub(mapping.file_offset);
    let displacement = base.wrapping_sub(bias) as i64;
    lib.relocate(displacement)?;

    let symbols_path = out_dir.join(SYMBOLS_FILE);
    let mut out = create(&symbols_path)?;
    let symbols = write_symbols(&lib, &config.symbol_names(), &mut out)?;
    out.flush().map_err(|e| Error::io(&symbols_path, e))?;

    let executable = match &config.executable {
        Some(name) => name.clone(),
        None => default_executable(&mut core)?,
    };
    let mappings_path = out_dir.join(MAPPINGS_FILE);
    let mut out = create(&mappings_path)?;
    let segments = write_mappings(&mut core, &executable, &mut out)?;
    out.flush().map_err(|e| Error::io(&mappings_path, e))?;

    Ok(PreparedRevival {
        library,
        displacement,
        segments: segments.len(),
        symbols,
    })
}
