use crate::error::{Error, Result};
use crate::image::ElfImage;
use crate::layout::SYM_SIZE;
use crate::sections::{name_at, SectionHeader};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use goblin::elf::sym::st_type;
use std::io::{self, BufRead, Cursor, Write};
use std::path::Path;

/// Symbols the revived process needs to find in the relocated runtime library.
pub const REQUIRED_SYMBOLS: &[&str] = &[
    "gHotSpotVMStructs",
    "gHotSpotVMTypes",
    "gHotSpotVMIntConstants",
    "gHotSpotVMLongConstants",
    "_SafeFetch32_fault",
    "_SafeFetch32_continuation",
    "_SafeFetchN_fault",
    "_SafeFetchN_continuation",
];

/// One `Elf64_Sym`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolEntry {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl SymbolEntry {
    pub fn decode(raw: &[u8]) -> io::Result<Self> {
        let mut reader = Cursor::new(raw);
        Ok(Self {
            st_name: reader.read_u32::<LE>()?,
            st_info: reader.read_u8()?,
            st_other: reader.read_u8()?,
            st_shndx: reader.read_u16::<LE>()?,
            st_value: reader.read_u64::<LE>()?,
            st_size: reader.read_u64::<LE>()?,
        })
    }

    pub fn to_writer<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LE>(self.st_name)?;
        out.write_u8(self.st_info)?;
        out.write_u8(self.st_other)?;
        out.write_u16::<LE>(self.st_shndx)?;
        out.write_u64::<LE>(self.st_value)?;
        out.write_u64::<LE>(self.st_size)
    }

    pub fn to_bytes(&self) -> [u8; SYM_SIZE] {
        let mut buf = [0u8; SYM_SIZE];
        let written = self.to_writer(&mut &mut buf[..]);
        debug_assert!(written.is_ok(), "SYM_SIZE bytes hold one record");
        buf
    }

    pub fn from_section(symtab_data: &[u8]) -> io::Result<Vec<SymbolEntry>> {
        if symtab_data.len() % SYM_SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "symbol table size is not a multiple of 24",
            ));
        }
        symtab_data.chunks_exact(SYM_SIZE).map(Self::decode).collect()
    }

    pub fn sym_type(&self) -> u8 {
        st_type(self.st_info)
    }

    pub fn name_from_strtab<'a>(&self, strtab_data: &'a [u8]) -> &'a str {
        name_at(strtab_data, self.st_name)
    }
}

/// Reads a symbol table section and the string table its `sh_link` names.
pub fn read_symbol_table(
    image: &ElfImage,
    symtab: &SectionHeader,
) -> Result<(Vec<SymbolEntry>, Vec<u8>)> {
    let data = image.section_data(symtab)?;
    let symbols = SymbolEntry::from_section(&data).map_err(|e| Error::io(image.path(), e))?;
    let strtab = image
        .section_headers
        .get(symtab.sh_link as usize)
        .ok_or_else(|| Error::format(image.path(), "symbol table links to a missing string table"))?;
    let names = image.section_data(strtab)?;
    Ok((symbols, names))
}

/// Addresses of the `wanted` symbols, in the order first found.
///
/// `.symtab` is searched before `.dynsym`; a name is reported once.
pub fn lookup_symbols(image: &ElfImage, wanted: &[&str]) -> Result<Vec<(String, u64)>> {
    let mut found: Vec<(String, u64)> = Vec::new();
    for section in [".symtab", ".dynsym"] {
        let Some(symtab) = image.find_section(section) else {
            log::debug!("{} has no {section}", image.path().display());
            continue;
        };
        let (symbols, names) = read_symbol_table(image, symtab)?;
        for symbol in &symbols {
            let name = symbol.name_from_strtab(&names);
            if wanted.contains(&name) && !found.iter().any(|(n, _)| n == name) {
                found.push((name.to_string(), symbol.st_value));
            }
        }
    }
    Ok(found)
}

/// Writes one `"<name> 0x<addr>"` line per required symbol present in `image`.
pub fn write_symbols<W: Write>(image: &ElfImage, wanted: &[&str], out: &mut W) -> Result<usize> {
    let found = lookup_symbols(image, wanted)?;
    for (name, addr) in &found {
        writeln!(out, "{name} {addr:#x}").map_err(|e| Error::io(image.path(), e))?;
    }
    for name in wanted {
        if !found.iter().any(|(n, _)| n == name) {
            log::warn!("{}: symbol {name} not found", image.path().display());
        }
    }
    log::info!("Wrote {} of {} symbols", found.len(), wanted.len());
    Ok(found.len())
}

/// Reads back what [`write_symbols`] wrote.
pub fn parse_symbols<R: BufRead>(source: &Path, input: R) -> Result<Vec<(String, u64)>> {
    let mut symbols = Vec::new();
    for (lineno, line) in input.lines().enumerate() {
        let line = line.map_err(|e| Error::io(source, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bad = || Error::format(source, format!("line {}: bad symbol line {line:?}", lineno + 1));
        let (name, addr) = line.split_once(' ').ok_or_else(bad)?;
        let addr = addr.trim().strip_prefix("0x").ok_or_else(bad)?;
        let addr = u64::from_str_radix(addr, 16).map_err(|_| bad())?;
        symbols.push((name.to_string(), addr));
    }
    Ok(symbols)
}
