use crate::layout::SHDR_SIZE;
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{self, Cursor};

/// One `Elf64_Shdr`, as stored in the section header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl SectionHeader {
    pub fn decode(raw: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(raw);
        Ok(Self {
            sh_name: cur.read_u32::<LE>()?,
            sh_type: cur.read_u32::<LE>()?,
            sh_flags: cur.read_u64::<LE>()?,
            sh_addr: cur.read_u64::<LE>()?,
            sh_offset: cur.read_u64::<LE>()?,
            sh_size: cur.read_u64::<LE>()?,
            sh_link: cur.read_u32::<LE>()?,
            sh_info: cur.read_u32::<LE>()?,
            sh_addralign: cur.read_u64::<LE>()?,
            sh_entsize: cur.read_u64::<LE>()?,
        })
    }

    pub fn to_writer<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LE>(self.sh_name)?;
        out.write_u32::<LE>(self.sh_type)?;
        out.write_u64::<LE>(self.sh_flags)?;
        out.write_u64::<LE>(self.sh_addr)?;
        out.write_u64::<LE>(self.sh_offset)?;
        out.write_u64::<LE>(self.sh_size)?;
        out.write_u32::<LE>(self.sh_link)?;
        out.write_u32::<LE>(self.sh_info)?;
        out.write_u64::<LE>(self.sh_addralign)?;
        out.write_u64::<LE>(self.sh_entsize)
    }

    pub fn to_bytes(&self) -> [u8; SHDR_SIZE] {
        let mut buf = [0u8; SHDR_SIZE];
        let written = self.to_writer(&mut &mut buf[..]);
        debug_assert!(written.is_ok(), "SHDR_SIZE bytes hold one record");
        buf
    }

    /// Number of `entsize`-sized records in the section, or zero if `sh_entsize` is unset.
    pub fn entry_count(&self) -> usize {
        if self.sh_entsize == 0 {
            0
        } else {
            (self.sh_size / self.sh_entsize) as usize
        }
    }
}

/// Reads the NUL-terminated string starting at `index` of a string table.
///
/// Out-of-range indices and invalid UTF-8 yield placeholders rather than errors,
/// since a bad name never stops a scan.
pub fn name_at(strtab: &[u8], index: u32) -> &str {
    let start = index as usize;
    if start >= strtab.len() {
        return "<invalid_name>";
    }
    let end = strtab[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|pos| start + pos)
        .unwrap_or(strtab.len());

    std::str::from_utf8(&strtab[start..end]).unwrap_or("<invalid_utf8>")
}
