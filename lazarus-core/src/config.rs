use crate::error::{Error, Result};
use crate::image::ElfImage;
use crate::symbols::REQUIRED_SYMBOLS;
use std::path::PathBuf;

/// Environment variable that must be `1` before a revival is prepared or run.
pub const LOAD_BIAS_ENV: &str = "LD_USE_LOAD_BIAS";

pub const DEFAULT_RUNTIME_LIBRARY: &str = "libjvm.so";

#[derive(Debug, Clone)]
pub struct RevivalConfig {
    /// Directory searched for the runtime library instead of its recorded path.
    pub library_dir: Option<PathBuf>,
    /// Substring identifying the runtime library among the core's file mappings.
    pub runtime_library: String,
    /// Substring identifying the main executable's mappings; `None` picks the
    /// first recorded mapping's file name.
    pub executable: Option<String>,
    pub symbols: Vec<String>,
}

impl Default for RevivalConfig {
    fn default() -> Self {
        Self {
            library_dir: None,
            runtime_library: DEFAULT_RUNTIME_LIBRARY.to_string(),
            executable: None,
            symbols: REQUIRED_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RevivalConfig {
    pub fn symbol_names(&self) -> Vec<&str> {
        self.symbols.iter().map(String::as_str).collect()
    }
}

/// Fails unless the dynamic loader has been told to honour load bias.
pub fn require_load_bias() -> Result<()> {
    check_load_bias(std::env::var(LOAD_BIAS_ENV).ok().as_deref())
}

fn check_load_bias(value: Option<&str>) -> Result<()> {
    match value {
        Some("1") => Ok(()),
        Some(other) => Err(Error::Environment(format!(
            "{LOAD_BIAS_ENV} is {other:?}; export {LOAD_BIAS_ENV}=1 before reviving"
        ))),
        None => Err(Error::Environment(format!(
            "{LOAD_BIAS_ENV} is not set; export {LOAD_BIAS_ENV}=1 before reviving"
        ))),
    }
}

/// Locates a usable copy of the runtime library the core had mapped.
pub fn resolve_runtime_library(core: &mut ElfImage, config: &RevivalConfig) -> Result<PathBuf> {
    let mapping = core.get_library_mapping(&config.runtime_library)?;

    if let Some(dir) = &config.library_dir {
        let candidate = dir.join(mapping.os_file_name());
        if !candidate.is_file() {
            return Err(Error::Config(format!(
                "{} not found in library directory {}",
                mapping.file_name(),
                dir.display()
            )));
        }
        log::info!("Using {} from library directory", candidate.display());
        return Ok(candidate);
    }

    let recorded = mapping.os_path.as_path();
    if !recorded.is_file() {
        return Err(Error::Environment(format!(
            "{} was mapped by the crashed process but is not present on this machine; \
             supply an override with --libdir",
            mapping.path
        )));
    }
    Ok(recorded.to_path_buf())
}
