//! Chooses which memory of a core dump the revived process must replay and
//! writes that choice as a mapping descriptor.

use crate::arch;
use crate::error::{Error, Result};
use crate::header::Header;
use crate::image::ElfImage;
use crate::tables::{flags_to_perms, perms_to_flags};
use goblin::elf::program_header::{PF_W, PT_LOAD};
use std::fmt;
use std::io::{BufRead, Write};
use std::path::Path;
use std::str::FromStr;

/// One region of the revived address space and where its bytes live in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub mem_size: u64,
    pub file_offset: u64,
    pub file_size: u64,
    /// `PF_*` bits of the originating program header.
    pub flags: u32,
}

impl Segment {
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    pub fn end(&self) -> u64 {
        self.vaddr + self.mem_size
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.vaddr <= addr && addr < self.end()
    }
}

/// The text form of a [`Segment`]: `0x<vaddr> 0x<memsz> 0x<offset> 0x<filesz> <perms>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRecord(pub Segment);

impl fmt::Display for MappingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.0;
        write!(
            f,
            "{:#x} {:#x} {:#x} {:#x} {}",
            s.vaddr,
            s.mem_size,
            s.file_offset,
            s.file_size,
            flags_to_perms(s.flags)
        )
    }
}

impl FromStr for MappingRecord {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [vaddr, mem_size, file_offset, file_size, perms] = fields[..] else {
            return Err(format!("expected 5 fields, found {}", fields.len()));
        };
        let hex = |field: &str| {
            field
                .strip_prefix("0x")
                .and_then(|digits| u64::from_str_radix(digits, 16).ok())
                .ok_or_else(|| format!("bad hex field {field:?}"))
        };
        Ok(MappingRecord(Segment {
            vaddr: hex(vaddr)?,
            mem_size: hex(mem_size)?,
            file_offset: hex(file_offset)?,
            file_size: hex(file_size)?,
            flags: perms_to_flags(perms).ok_or_else(|| format!("bad permissions {perms:?}"))?,
        }))
    }
}

/// Picks the core's `PT_LOAD` segments whose content must come from the core itself.
///
/// Segments are dropped when they are empty, when they belong to the main
/// executable (re-executing it restores them), or when they are read-only and
/// backed by a file that is still on disk. Enumeration stops at the kernel half
/// of the address space.
pub fn select_segments(image: &mut ElfImage, executable: &str) -> Result<Vec<Segment>> {
    if !image.header.is_core() {
        return Err(Error::format(
            image.path(),
            format!("expected a core file, found {}", image.header.type_name()),
        ));
    }
    let mappings = image.shared_library_mappings()?.to_vec();

    let mut loads: Vec<_> = image
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .copied()
        .collect();
    loads.sort_by_key(|ph| ph.p_vaddr);

    let mut segments = Vec::new();
    for ph in &loads {
        if ph.p_filesz == 0 || ph.p_memsz == 0 {
            continue;
        }
        if ph.p_vaddr >= arch::USER_ADDRESS_LIMIT {
            log::debug!("Stopping at kernel address {:#x}", ph.p_vaddr);
            break;
        }
        let end = ph.p_vaddr.saturating_add(ph.p_memsz);
        let from_executable = mappings
            .iter()
            .any(|m| m.path.contains(executable) && m.overlaps(ph.p_vaddr, end));
        if from_executable {
            log::debug!("{:#x}: belongs to {executable}", ph.p_vaddr);
            continue;
        }
        if !ph.is_writable() && mappings.iter().any(|m| m.overlaps(ph.p_vaddr, end)) {
            log::debug!("{:#x}: read-only and file backed", ph.p_vaddr);
            continue;
        }
        segments.push(Segment {
            vaddr: ph.p_vaddr,
            mem_size: ph.p_memsz,
            file_offset: ph.p_offset,
            file_size: ph.p_filesz,
            flags: ph.p_flags,
        });
    }
    log::info!(
        "{}: {} of {} loads selected",
        image.path().display(),
        segments.len(),
        loads.len()
    );
    Ok(segments)
}

/// Name used for the main executable when none is configured: the file name of
/// the first NT_FILE entry, which the kernel lists lowest address first.
pub fn default_executable(image: &mut ElfImage) -> Result<String> {
    let path = image.path().to_path_buf();
    image
        .shared_library_mappings()?
        .first()
        .map(|m| m.file_name().to_string())
        .ok_or_else(|| Error::not_found(&path, "any file mapping"))
}

/// Writes one [`MappingRecord`] line per selected segment.
pub fn write_mappings<W: Write>(
    image: &mut ElfImage,
    executable: &str,
    out: &mut W,
) -> Result<Vec<Segment>> {
    let segments = select_segments(image, executable)?;
    for segment in &segments {
        writeln!(out, "{}", MappingRecord(*segment)).map_err(|e| Error::io(image.path(), e))?;
    }
    Ok(segments)
}

/// Reads a mapping descriptor; blank lines and `#` comments are skipped.
pub fn parse_mappings<R: BufRead>(source: &Path, input: R) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for (lineno, line) in input.lines().enumerate() {
        let line = line.map_err(|e| Error::io(source, e))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record: MappingRecord = line
            .parse()
            .map_err(|e| Error::format(source, format!("line {}: {e}", lineno + 1)))?;
        segments.push(record.0);
    }
    Ok(segments)
}
