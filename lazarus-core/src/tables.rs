//! Program headers, dynamic entries and relocation entries.

use crate::layout::{DYN_SIZE, PHDR_SIZE, RELA_SIZE};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use goblin::elf::program_header::{PF_R, PF_W, PF_X};
use std::io::{self, Cursor};

/// One `Elf64_Phdr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl ProgramHeader {
    pub fn decode(raw: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(raw);
        Ok(Self {
            p_type: cur.read_u32::<LE>()?,
            p_flags: cur.read_u32::<LE>()?,
            p_offset: cur.read_u64::<LE>()?,
            p_vaddr: cur.read_u64::<LE>()?,
            p_paddr: cur.read_u64::<LE>()?,
            p_filesz: cur.read_u64::<LE>()?,
            p_memsz: cur.read_u64::<LE>()?,
            p_align: cur.read_u64::<LE>()?,
        })
    }

    pub fn to_writer<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LE>(self.p_type)?;
        out.write_u32::<LE>(self.p_flags)?;
        out.write_u64::<LE>(self.p_offset)?;
        out.write_u64::<LE>(self.p_vaddr)?;
        out.write_u64::<LE>(self.p_paddr)?;
        out.write_u64::<LE>(self.p_filesz)?;
        out.write_u64::<LE>(self.p_memsz)?;
        out.write_u64::<LE>(self.p_align)
    }

    pub fn to_bytes(&self) -> [u8; PHDR_SIZE] {
        let mut buf = [0u8; PHDR_SIZE];
        let written = self.to_writer(&mut &mut buf[..]);
        debug_assert!(written.is_ok(), "PHDR_SIZE bytes hold one record");
        buf
    }

    pub fn is_writable(&self) -> bool {
        self.p_flags & PF_W != 0
    }

    /// Whether `[start, end)` intersects `[p_vaddr, p_vaddr + p_memsz)`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.p_vaddr < end && start < self.p_vaddr.saturating_add(self.p_memsz)
    }

    pub fn contains_vaddr(&self, addr: u64) -> bool {
        addr >= self.p_vaddr && addr - self.p_vaddr < self.p_filesz
    }
}

/// Renders `PF_*` bits the way `/proc/<pid>/maps` does.
pub fn flags_to_perms(flags: u32) -> String {
    let mut perms = String::with_capacity(3);
    perms.push(if flags & PF_R != 0 { 'r' } else { '-' });
    perms.push(if flags & PF_W != 0 { 'w' } else { '-' });
    perms.push(if flags & PF_X != 0 { 'x' } else { '-' });
    perms
}

pub fn perms_to_flags(perms: &str) -> Option<u32> {
    let bytes = perms.as_bytes();
    if bytes.len() != 3 {
        return None;
    }
    let mut flags = 0;
    for (byte, (set, bit)) in bytes.iter().zip([(b'r', PF_R), (b'w', PF_W), (b'x', PF_X)]) {
        match *byte {
            b'-' => {}
            b if b == set => flags |= bit,
            _ => return None,
        }
    }
    Some(flags)
}

/// One `Elf64_Dyn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicEntry {
    pub d_tag: u64,
    pub d_val: u64,
}

impl DynamicEntry {
    pub fn decode(raw: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(raw);
        Ok(Self {
            d_tag: cur.read_u64::<LE>()?,
            d_val: cur.read_u64::<LE>()?,
        })
    }

    pub fn to_writer<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LE>(self.d_tag)?;
        out.write_u64::<LE>(self.d_val)
    }

    pub fn to_bytes(&self) -> [u8; DYN_SIZE] {
        let mut buf = [0u8; DYN_SIZE];
        let written = self.to_writer(&mut &mut buf[..]);
        debug_assert!(written.is_ok(), "DYN_SIZE bytes hold one record");
        buf
    }
}

/// One `Elf64_Rela`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

impl RelocationEntry {
    pub fn decode(raw: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(raw);
        Ok(Self {
            r_offset: cur.read_u64::<LE>()?,
            r_info: cur.read_u64::<LE>()?,
            r_addend: cur.read_i64::<LE>()?,
        })
    }

    pub fn to_writer<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LE>(self.r_offset)?;
        out.write_u64::<LE>(self.r_info)?;
        out.write_i64::<LE>(self.r_addend)
    }

    pub fn to_bytes(&self) -> [u8; RELA_SIZE] {
        let mut buf = [0u8; RELA_SIZE];
        let written = self.to_writer(&mut &mut buf[..]);
        debug_assert!(written.is_ok(), "RELA_SIZE bytes hold one record");
        buf
    }

    pub fn kind(&self) -> u32 {
        (self.r_info & 0xffff_ffff) as u32
    }

    pub fn sym(&self) -> u32 {
        (self.r_info >> 32) as u32
    }
}
