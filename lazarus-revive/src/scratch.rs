//! Backing store for segments that have been written to since revival.
//!
//! The core itself is never opened for writing, so a segment that takes a
//! write fault is copied here and remapped from this file instead.

use crate::error::Result;
use crate::mmap::page_size;
use lazarus_core::layout::align_up;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SCRATCH_FILE: &str = "scratch.pages";

pub struct ScratchFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ScratchFile {
    /// Nothing touches the disk until the first [`append`](Self::append).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create(&self) -> io::Result<File> {
        match fs::remove_file(&self.path) {
            Ok(()) => log::warn!("Removed stale scratch file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        log::info!("Created scratch file {}", self.path.display());
        Ok(file)
    }

    /// Appends `bytes` at the next page boundary.
    ///
    /// Returns a handle to the file and the offset the bytes start at.
    pub fn append(&self, bytes: &[u8]) -> Result<(File, u64)> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let file = match &mut *guard {
            Some(file) => file,
            empty => empty.insert(self.create()?),
        };

        let offset = align_up(file.metadata()?.len(), page_size() as u64);
        file.write_all_at(bytes, offset)?;
        let padded = align_up(offset + bytes.len() as u64, page_size() as u64);
        file.set_len(padded)?;
        Ok((file.try_clone()?, offset))
    }
}
