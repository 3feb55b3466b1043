use crate::arch;
use crate::error::{Error, Result};
use crate::header::elf::{Elf64Ehdr, PN_XNUM};
use crate::header::Header;
use crate::layout::{EHDR_SIZE, PHDR_SIZE, SHDR_SIZE};
use crate::note::SharedLibraryMapping;
use crate::sections::{name_at, SectionHeader};
use crate::tables::ProgramHeader;
use goblin::elf::header::{EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, ELFMAG, SELFMAG};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::section_header::SHN_UNDEF;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// An open, validated 64-bit ELF file with its header tables decoded.
///
/// Tables are decoded once at [`ElfImage::open`]; the relocator edits the
/// in-memory copies and writes each record back in place.
#[derive(Debug)]
pub struct ElfImage {
    path: PathBuf,
    file: File,
    mode: OpenMode,
    pub header: Elf64Ehdr,
    pub program_headers: Vec<ProgramHeader>,
    pub section_headers: Vec<SectionHeader>,
    shstrtab: Option<Vec<u8>>,
    pub(crate) mappings: Option<Vec<SharedLibraryMapping>>,
}

impl ElfImage {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        let mut raw = [0u8; EHDR_SIZE];
        file.read_exact_at(&mut raw, 0)
            .map_err(|_| Error::format(path, "file too short for an ELF header"))?;
        let header = Elf64Ehdr::from_reader(&mut &raw[..]).map_err(|e| Error::io(path, e))?;
        validate(path, &header)?;

        let mut image = Self {
            path: path.to_path_buf(),
            file,
            mode,
            header,
            program_headers: Vec::new(),
            section_headers: Vec::new(),
            shstrtab: None,
            mappings: None,
        };
        image.load_program_headers()?;
        image.load_section_headers()?;

        log::debug!(
            "Opened {} ({}, {} program headers, {} sections)",
            image.path.display(),
            image.header.type_name(),
            image.program_headers.len(),
            image.section_headers.len()
        );
        Ok(image)
    }

    fn load_program_headers(&mut self) -> Result<()> {
        let count = self.header.e_phnum as usize;
        if count == 0 {
            return Ok(());
        }
        if self.header.e_phentsize as usize != PHDR_SIZE {
            return Err(Error::format(
                &self.path,
                format!("unexpected program header size {}", self.header.e_phentsize),
            ));
        }
        let table = self.read_at(self.header.e_phoff, count * PHDR_SIZE)?;
        self.program_headers = table
            .chunks_exact(PHDR_SIZE)
            .map(ProgramHeader::decode)
            .collect::<std::io::Result<_>>()
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }

    fn load_section_headers(&mut self) -> Result<()> {
        let count = self.header.e_shnum as usize;
        if count == 0 || self.header.e_shoff == 0 {
            log::debug!("{} has no section headers", self.path.display());
            return Ok(());
        }
        if self.header.e_shentsize as usize != SHDR_SIZE {
            return Err(Error::format(
                &self.path,
                format!("unexpected section header size {}", self.header.e_shentsize),
            ));
        }
        let table = self.read_at(self.header.e_shoff, count * SHDR_SIZE)?;
        self.section_headers = table
            .chunks_exact(SHDR_SIZE)
            .map(SectionHeader::decode)
            .collect::<std::io::Result<_>>()
            .map_err(|e| Error::io(&self.path, e))?;

        let strndx = self.header.e_shstrndx as usize;
        if strndx != SHN_UNDEF as usize && strndx < self.section_headers.len() {
            let strtab = self.section_headers[strndx];
            self.shstrtab = Some(self.section_data(&strtab)?);
        } else {
            log::warn!("{} has no section name string table", self.path.display());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_section_names(&self) -> bool {
        self.shstrtab.is_some()
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.mode != OpenMode::ReadWrite {
            return Err(Error::Precondition(format!(
                "{} was opened read-only",
                self.path.display()
            )));
        }
        self.file
            .write_all_at(data, offset)
            .map_err(|e| Error::io(&self.path, e))
    }

    pub fn read_u64_at(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64_at(&self, offset: u64, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn section_data(&self, sh: &SectionHeader) -> Result<Vec<u8>> {
        self.read_at(sh.sh_offset, sh.sh_size as usize)
    }

    pub fn section_name(&self, sh: &SectionHeader) -> &str {
        match &self.shstrtab {
            Some(strtab) => name_at(strtab, sh.sh_name),
            None => "",
        }
    }

    /// Index of the first section called `name`.
    pub fn section_index(&self, name: &str) -> Option<usize> {
        self.section_headers
            .iter()
            .position(|sh| self.section_name(sh) == name)
    }

    pub fn find_section(&self, name: &str) -> Option<&SectionHeader> {
        self.section_index(name).map(|i| &self.section_headers[i])
    }

    pub fn section_by_name(&self, name: &str) -> Result<&SectionHeader> {
        self.find_section(name)
            .ok_or_else(|| Error::not_found(&self.path, format!("section {name}")))
    }

    pub fn program_header_by_type(&self, p_type: u32) -> Option<&ProgramHeader> {
        self.program_header_by_predicate(|ph| ph.p_type == p_type)
    }

    pub fn program_header_by_predicate<F>(&self, pred: F) -> Option<&ProgramHeader>
    where
        F: Fn(&ProgramHeader) -> bool,
    {
        self.program_headers.iter().find(|ph| pred(ph))
    }

    /// File offset of `addr` according to the first `PT_LOAD` entry, in header
    /// order, whose `p_vaddr >= addr`.
    ///
    /// Not the usual "segment containing the address" rule. The relocator
    /// does not use it.
    pub fn file_offset_for_vaddr(&self, addr: u64) -> Option<u64> {
        self.program_headers
            .iter()
            .find(|ph| ph.p_type == PT_LOAD && ph.p_vaddr >= addr)
            .map(|ph| ph.p_offset.wrapping_add(addr.wrapping_sub(ph.p_vaddr)))
    }

    pub fn write_header(&self) -> Result<()> {
        self.write_at(0, &self.header.to_bytes())
    }

    pub fn write_program_header(&self, index: usize) -> Result<()> {
        let offset = self.header.e_phoff + (index * PHDR_SIZE) as u64;
        self.write_at(offset, &self.program_headers[index].to_bytes())
    }

    pub fn write_section_header(&self, index: usize) -> Result<()> {
        let offset = self.header.e_shoff + (index * SHDR_SIZE) as u64;
        self.write_at(offset, &self.section_headers[index].to_bytes())
    }
}

fn validate(path: &Path, header: &Elf64Ehdr) -> Result<()> {
    if header.e_ident[..SELFMAG] != ELFMAG[..] {
        return Err(Error::format(path, "bad ELF magic"));
    }
    if header.e_ident[EI_CLASS] != ELFCLASS64 {
        return Err(Error::format(path, "not a 64-bit ELF object"));
    }
    if header.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(Error::format(path, "not a little-endian ELF object"));
    }
    if header.machine() != arch::EM_HOST {
        return Err(Error::format(
            path,
            format!(
                "machine {} does not match host {}",
                arch::machine_name(header.machine()),
                arch::machine_name(arch::EM_HOST)
            ),
        ));
    }
    if header.e_phnum == PN_XNUM {
        return Err(Error::format(
            path,
            "extended program header count (PN_XNUM) is not supported",
        ));
    }
    if header.is_shared_object() && header.e_shnum == 0 {
        return Err(Error::format(path, "shared object without section headers"));
    }
    Ok(())
}
