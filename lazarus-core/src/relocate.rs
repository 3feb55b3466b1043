//! Moves a position-independent shared object to a new base address by
//! rewriting every address-bearing field of the file in place.

use crate::arch;
use crate::error::{Error, Result};
use crate::header::Header;
use crate::image::ElfImage;
use crate::layout::{DYN_SIZE, RELA_SIZE, SYM_SIZE};
use crate::symbols::SymbolEntry;
use crate::tables::{DynamicEntry, ProgramHeader, RelocationEntry};
use goblin::elf::dynamic::{
    DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_GNU_HASH, DT_HASH, DT_INIT, DT_INIT_ARRAY,
    DT_INIT_ARRAYSZ, DT_JMPREL, DT_NULL, DT_PLTGOT, DT_RELA, DT_STRTAB, DT_SYMTAB, DT_VERDEF,
    DT_VERNEED, DT_VERSYM,
};
use goblin::elf::program_header::{PT_GNU_STACK, PT_LOAD};
use goblin::elf::section_header::{SHN_ABS, SHN_UNDEF, SHT_NULL};
use goblin::elf::sym::STT_TLS;

/// Sections whose `sh_addr` is never moved.
pub const UNRELOCATED_SECTIONS: &[&str] = &[
    ".comment",
    ".note.stapsdt",
    ".note.gnu.gold-version",
    ".gnu_debuglink",
    ".symtab",
    ".shstrtab",
    ".strtab",
];

/// Dynamic tags whose value is an address inside the object.
pub const ADDRESS_TAGS: &[u64] = &[
    DT_INIT, DT_FINI, DT_HASH, DT_GNU_HASH, DT_STRTAB, DT_SYMTAB, DT_PLTGOT, DT_JMPREL, DT_RELA,
    DT_VERDEF, DT_VERNEED, DT_VERSYM,
];

fn shift(value: u64, displacement: i64) -> u64 {
    value.wrapping_add_signed(displacement)
}

/// `PT_LOAD` placement captured before program headers move, used to find
/// arrays named by dynamic entries.
struct LoadLayout(Vec<ProgramHeader>);

impl LoadLayout {
    fn offset_of(&self, vaddr: u64) -> Option<u64> {
        self.0
            .iter()
            .find(|ph| ph.contains_vaddr(vaddr))
            .map(|ph| ph.p_offset + (vaddr - ph.p_vaddr))
    }
}

impl ElfImage {
    /// Lowest `PT_LOAD` address, rounded down to that segment's alignment.
    pub fn load_bias(&self) -> Option<u64> {
        self.program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| {
                let align = ph.p_align.max(1);
                if align.is_power_of_two() {
                    ph.p_vaddr & !(align - 1)
                } else {
                    ph.p_vaddr
                }
            })
            .min()
    }

    /// Adds `displacement` to every absolute address in the file.
    ///
    /// The image must be a shared object opened read-write. Nothing is rolled
    /// back on failure; callers relocate a private copy.
    pub fn relocate(&mut self, displacement: i64) -> Result<()> {
        if !self.header.is_shared_object() {
            return Err(Error::Precondition(format!(
                "{} is {}, not a shared object",
                self.path().display(),
                self.header.type_name()
            )));
        }
        if self.section_headers.is_empty() {
            return Err(Error::Precondition(format!(
                "{} has no section headers",
                self.path().display()
            )));
        }
        if !self.has_section_names() {
            return Err(Error::Precondition(format!(
                "{} has no section name string table",
                self.path().display()
            )));
        }

        log::info!(
            "Relocating {} by {:#x}",
            self.path().display(),
            displacement
        );
        let layout = LoadLayout(
            self.program_headers
                .iter()
                .filter(|ph| ph.p_type == PT_LOAD)
                .copied()
                .collect(),
        );

        self.relocate_entry(displacement)?;
        self.relocate_program_headers(displacement)?;
        self.relocate_section_headers(displacement)?;
        for name in [".rela.dyn", ".rela.plt"] {
            self.relocate_rela(name, displacement)?;
        }
        self.relocate_dynamic(&layout, displacement)?;
        for name in [".dynsym", ".symtab"] {
            self.relocate_symbols(name, displacement)?;
        }
        Ok(())
    }

    fn relocate_entry(&mut self, displacement: i64) -> Result<()> {
        if self.header.e_entry == 0 {
            return Ok(());
        }
        self.header.e_entry = shift(self.header.e_entry, displacement);
        self.write_header()
    }

    fn relocate_program_headers(&mut self, displacement: i64) -> Result<()> {
        for i in 0..self.program_headers.len() {
            let ph = &mut self.program_headers[i];
            if ph.p_type == PT_GNU_STACK {
                continue;
            }
            ph.p_vaddr = shift(ph.p_vaddr, displacement);
            ph.p_paddr = shift(ph.p_paddr, displacement);
            self.write_program_header(i)?;
        }
        Ok(())
    }

    fn relocate_section_headers(&mut self, displacement: i64) -> Result<()> {
        for i in 0..self.section_headers.len() {
            let sh = self.section_headers[i];
            if sh.sh_type == SHT_NULL || UNRELOCATED_SECTIONS.contains(&self.section_name(&sh)) {
                continue;
            }
            self.section_headers[i].sh_addr = shift(sh.sh_addr, displacement);
            self.write_section_header(i)?;
        }
        Ok(())
    }

    fn relocate_rela(&mut self, name: &str, displacement: i64) -> Result<()> {
        let Some(sh) = self.find_section(name).copied() else {
            log::debug!("No {name} in {}", self.path().display());
            return Ok(());
        };
        let data = self.section_data(&sh)?;
        let mut addends = 0;
        for (i, raw) in data.chunks_exact(RELA_SIZE).enumerate() {
            let mut rela = RelocationEntry::decode(raw).map_err(|e| Error::io(self.path(), e))?;
            rela.r_offset = shift(rela.r_offset, displacement);
            if arch::addend_is_address(rela.kind(), rela.sym()) {
                rela.r_addend = rela.r_addend.wrapping_add(displacement);
                addends += 1;
            }
            self.write_at(sh.sh_offset + (i * RELA_SIZE) as u64, &rela.to_bytes())?;
        }
        log::debug!(
            "{name}: {} entries, {addends} addends moved",
            data.len() / RELA_SIZE
        );
        Ok(())
    }

    fn relocate_dynamic(&mut self, layout: &LoadLayout, displacement: i64) -> Result<()> {
        let sh = *self.section_by_name(".dynamic")?;
        let data = self.section_data(&sh)?;
        let entries = data
            .chunks_exact(DYN_SIZE)
            .map(DynamicEntry::decode)
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::io(self.path(), e))?;

        let value_of = |tag: u64| {
            entries
                .iter()
                .take_while(|d| d.d_tag != DT_NULL)
                .find(|d| d.d_tag == tag)
                .map(|d| d.d_val)
        };
        let init_array_size = value_of(DT_INIT_ARRAYSZ).unwrap_or(0);
        let fini_array_size = value_of(DT_FINI_ARRAYSZ).unwrap_or(0);

        for (i, entry) in entries.iter().enumerate() {
            if entry.d_tag == DT_NULL {
                break;
            }
            let array_size = match entry.d_tag {
                DT_INIT_ARRAY => Some(init_array_size),
                DT_FINI_ARRAY => Some(fini_array_size),
                tag if ADDRESS_TAGS.contains(&tag) => None,
                _ => continue,
            };
            if let Some(size) = array_size {
                self.relocate_pointer_array(layout, entry.d_val, size, displacement)?;
            }
            let moved = DynamicEntry {
                d_tag: entry.d_tag,
                d_val: shift(entry.d_val, displacement),
            };
            self.write_at(sh.sh_offset + (i * DYN_SIZE) as u64, &moved.to_bytes())?;
        }
        Ok(())
    }

    /// Moves every nonzero function pointer of an init/fini array.
    fn relocate_pointer_array(
        &self,
        layout: &LoadLayout,
        vaddr: u64,
        size: u64,
        displacement: i64,
    ) -> Result<()> {
        let offset = layout.offset_of(vaddr).ok_or_else(|| {
            Error::format(
                self.path(),
                format!("pointer array at {vaddr:#x} is outside every PT_LOAD"),
            )
        })?;
        for n in 0..size / 8 {
            let at = offset + n * 8;
            let pointer = self.read_u64_at(at)?;
            if pointer != 0 {
                self.write_u64_at(at, shift(pointer, displacement))?;
            }
        }
        Ok(())
    }

    fn relocate_symbols(&mut self, name: &str, displacement: i64) -> Result<()> {
        let Some(sh) = self.find_section(name).copied() else {
            log::debug!("No {name} in {}", self.path().display());
            return Ok(());
        };
        let data = self.section_data(&sh)?;
        let symbols = SymbolEntry::from_section(&data).map_err(|e| Error::io(self.path(), e))?;
        for (i, symbol) in symbols.iter().enumerate() {
            let fixed = symbol.sym_type() == STT_TLS
                || symbol.st_shndx == SHN_UNDEF as u16
                || symbol.st_shndx == SHN_ABS as u16;
            if fixed {
                continue;
            }
            let moved = SymbolEntry {
                st_value: shift(symbol.st_value, displacement),
                ..*symbol
            };
            self.write_at(sh.sh_offset + (i * SYM_SIZE) as u64, &moved.to_bytes())?;
        }
        Ok(())
    }
}
