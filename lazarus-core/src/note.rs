use crate::error::{Error, Result};
use crate::image::ElfImage;
use crate::layout::{align_up, NHDR_SIZE};
use byteorder::{ReadBytesExt, LE};
use goblin::elf::program_header::PT_NOTE;
use serde::Serialize;
use std::ffi::OsStr;
use std::io::{Cursor, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Note type of the kernel's file-mapping table ("FILE").
pub const NT_FILE: u32 = 0x4649_4c45;

/// Note records are padded to this boundary, for both name and descriptor.
pub const NOTE_ALIGN: u64 = 4;

/// One record of a `PT_NOTE` segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteEntry {
    pub n_type: u32,
    pub name: Vec<u8>,
    pub desc: Vec<u8>,
}

impl NoteEntry {
    /// Name without its trailing NUL.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("<invalid_utf8>")
    }
}

/// One entry of the NT_FILE table: a file mapped at `[start, end)` when the core was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedLibraryMapping {
    pub start: u64,
    pub end: u64,
    /// Byte offset into `path` at which the mapping starts.
    pub file_offset: u64,
    /// `os_path` for display; bytes that are not UTF-8 are replaced.
    pub path: String,
    /// The recorded path byte for byte, for filesystem lookups.
    #[serde(skip)]
    pub os_path: PathBuf,
}

impl SharedLibraryMapping {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    pub fn file_name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path)
    }

    /// Final component of the recorded path as the filesystem sees it.
    pub fn os_file_name(&self) -> &OsStr {
        self.os_path.file_name().unwrap_or(self.os_path.as_os_str())
    }
}

/// Splits a `PT_NOTE` segment into records.
pub fn parse_notes(path: &Path, data: &[u8]) -> Result<Vec<NoteEntry>> {
    let mut notes = Vec::new();
    let mut pos = 0u64;
    let len = data.len() as u64;

    while pos + NHDR_SIZE as u64 <= len {
        let mut cur = Cursor::new(&data[pos as usize..]);
        let truncated = |_| Error::format(path, "truncated note header");
        let namesz = cur.read_u32::<LE>().map_err(truncated)? as u64;
        let descsz = cur.read_u32::<LE>().map_err(truncated)? as u64;
        let n_type = cur.read_u32::<LE>().map_err(truncated)?;

        let name_start = pos + NHDR_SIZE as u64;
        let desc_start = name_start + align_up(namesz, NOTE_ALIGN);
        let desc_end = desc_start + descsz;
        if desc_end > len {
            return Err(Error::format(
                path,
                format!("note of type {n_type:#x} at {pos:#x} runs past its segment"),
            ));
        }

        notes.push(NoteEntry {
            n_type,
            name: data[name_start as usize..(name_start + namesz) as usize].to_vec(),
            desc: data[desc_start as usize..desc_end as usize].to_vec(),
        });
        pos = desc_start + align_up(descsz, NOTE_ALIGN);
    }
    Ok(notes)
}

/// Decodes an NT_FILE descriptor: count, page size, `count` (start, end, page offset)
/// triples, then `count` NUL-terminated paths.
pub fn parse_nt_file(path: &Path, desc: &[u8]) -> Result<Vec<SharedLibraryMapping>> {
    let truncated = |_| Error::format(path, "truncated NT_FILE descriptor");
    let mut cur = Cursor::new(desc);
    let count = cur.read_u64::<LE>().map_err(truncated)?;
    let page_size = cur.read_u64::<LE>().map_err(truncated)?;

    // Each entry needs at least 24 bytes of triple and one NUL.
    if count > desc.len() as u64 / 25 {
        return Err(Error::format(
            path,
            format!("NT_FILE claims {count} entries in {} bytes", desc.len()),
        ));
    }

    let mut ranges = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start = cur.read_u64::<LE>().map_err(truncated)?;
        let end = cur.read_u64::<LE>().map_err(truncated)?;
        let pgoff = cur.read_u64::<LE>().map_err(truncated)?;
        ranges.push((start, end, pgoff.wrapping_mul(page_size)));
    }

    let mut names = Vec::new();
    cur.read_to_end(&mut names).map_err(truncated)?;
    let mut paths = names.split(|&b| b == 0);

    let mut mappings = Vec::with_capacity(ranges.len());
    for (start, end, file_offset) in ranges {
        let raw = paths
            .next()
            .ok_or_else(|| Error::format(path, "NT_FILE has fewer paths than entries"))?;
        mappings.push(SharedLibraryMapping {
            start,
            end,
            file_offset,
            path: String::from_utf8_lossy(raw).into_owned(),
            os_path: PathBuf::from(OsStr::from_bytes(raw)),
        });
    }
    // split() yields a trailing empty piece after the final NUL; a missing NUL leaves none.
    if !names.ends_with(&[0]) && count > 0 {
        return Err(Error::format(path, "NT_FILE path table is not NUL-terminated"));
    }
    Ok(mappings)
}

impl ElfImage {
    /// All note records of all `PT_NOTE` segments, in file order.
    pub fn notes(&self) -> Result<Vec<NoteEntry>> {
        let mut notes = Vec::new();
        for ph in self.program_headers.iter().filter(|ph| ph.p_type == PT_NOTE) {
            let data = self.read_at(ph.p_offset, ph.p_filesz as usize)?;
            notes.extend(parse_notes(self.path(), &data)?);
        }
        Ok(notes)
    }

    /// The NT_FILE table, decoded on first use and cached for the image's lifetime.
    pub fn shared_library_mappings(&mut self) -> Result<&[SharedLibraryMapping]> {
        if self.mappings.is_none() {
            let mut found = None;
            for ph in self.program_headers.iter().filter(|ph| ph.p_type == PT_NOTE) {
                let data = self.read_at(ph.p_offset, ph.p_filesz as usize)?;
                if let Some(note) = parse_notes(self.path(), &data)?
                    .into_iter()
                    .find(|n| n.n_type == NT_FILE)
                {
                    found = Some(note);
                    break;
                }
            }
            let note = found.ok_or_else(|| Error::format(self.path(), "no NT_FILE note"))?;
            let mappings = parse_nt_file(self.path(), &note.desc)?;
            log::info!(
                "{}: {} file mappings recorded",
                self.path().display(),
                mappings.len()
            );
            self.mappings = Some(mappings);
        }
        Ok(self.mappings.as_deref().unwrap_or_default())
    }

    /// First recorded mapping whose path contains `substr`.
    pub fn get_library_mapping(&mut self, substr: &str) -> Result<SharedLibraryMapping> {
        let path = self.path().to_path_buf();
        self.shared_library_mappings()?
            .iter()
            .find(|m| m.path.contains(substr))
            .cloned()
            .ok_or_else(|| Error::not_found(&path, format!("mapping of {substr}")))
    }
}
