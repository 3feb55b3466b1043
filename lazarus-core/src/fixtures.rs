//! Synthetic ELF images for tests, written byte by byte.

use crate::arch;
use crate::layout::{DYN_SIZE, PHDR_SIZE, RELA_SIZE, SHDR_SIZE, SYM_SIZE};
use crate::sections::SectionHeader;
use crate::symbols::SymbolEntry;
use crate::tables::{DynamicEntry, ProgramHeader, RelocationEntry};
use goblin::elf::dynamic::{
    DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_GNU_HASH, DT_INIT, DT_INIT_ARRAY,
    DT_INIT_ARRAYSZ, DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTGOT, DT_RELA, DT_RELASZ, DT_STRSZ,
    DT_STRTAB, DT_SYMENT, DT_SYMTAB,
};
use goblin::elf::header::{ET_CORE, ET_DYN};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_DYNAMIC, PT_GNU_STACK, PT_LOAD, PT_NOTE};
use goblin::elf::section_header::{
    SHF_ALLOC, SHN_ABS, SHN_UNDEF, SHT_DYNAMIC, SHT_DYNSYM, SHT_FINI_ARRAY, SHT_INIT_ARRAY,
    SHT_NOTE, SHT_PROGBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB,
};
use goblin::elf::sym::{STB_GLOBAL, STT_FUNC, STT_OBJECT, STT_TLS};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A `/tmp` path removed, with anything below it, when dropped.
#[derive(Debug)]
pub struct TempPath(PathBuf);

impl Deref for TempPath {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for TempPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        let _ = if self.0.is_dir() {
            std::fs::remove_dir_all(&self.0)
        } else {
            std::fs::remove_file(&self.0)
        };
    }
}

pub fn unique_path(prefix: &str) -> TempPath {
    let count = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    TempPath(PathBuf::from(format!(
        "/tmp/lazarus_test_{}_{}_{}",
        prefix,
        std::process::id(),
        count
    )))
}

/// A growable byte image with positional writes.
#[derive(Default)]
struct Blob(Vec<u8>);

impl Blob {
    fn put(&mut self, offset: u64, bytes: &[u8]) {
        let offset = offset as usize;
        if self.0.len() < offset + bytes.len() {
            self.0.resize(offset + bytes.len(), 0);
        }
        self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

fn ehdr(e_type: u16, phnum: u16, shoff: u64, shnum: u16, shstrndx: u16, entry: u64) -> Vec<u8> {
    let mut raw = Vec::with_capacity(64);
    raw.extend_from_slice(b"\x7fELF");
    raw.extend_from_slice(&[2, 1, 1, 0]);
    raw.extend_from_slice(&[0; 8]);
    raw.extend_from_slice(&e_type.to_le_bytes());
    raw.extend_from_slice(&arch::EM_HOST.to_le_bytes());
    raw.extend_from_slice(&1u32.to_le_bytes());
    raw.extend_from_slice(&entry.to_le_bytes());
    raw.extend_from_slice(&64u64.to_le_bytes());
    raw.extend_from_slice(&shoff.to_le_bytes());
    raw.extend_from_slice(&0u32.to_le_bytes());
    raw.extend_from_slice(&64u16.to_le_bytes());
    raw.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    raw.extend_from_slice(&phnum.to_le_bytes());
    raw.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
    raw.extend_from_slice(&shnum.to_le_bytes());
    raw.extend_from_slice(&shstrndx.to_le_bytes());
    raw
}

/// A string table under construction; remembers where each name landed.
struct StrTab(Vec<u8>);

impl StrTab {
    fn new() -> Self {
        StrTab(vec![0])
    }

    fn add(&mut self, name: &str) -> u32 {
        let index = self.0.len() as u32;
        self.0.extend_from_slice(name.as_bytes());
        self.0.push(0);
        index
    }
}

pub const ENTRY: u64 = 0x600;
pub const DYNSYM_OFFSET: u64 = 0x200;
pub const RELA_DYN_OFFSET: u64 = 0x400;
pub const RELA_PLT_OFFSET: u64 = 0x500;
pub const INIT_ARRAY_VADDR: u64 = 0x2000;
pub const INIT_ARRAY_OFFSET: u64 = 0x1000;
pub const FINI_ARRAY_VADDR: u64 = 0x2010;
pub const FINI_ARRAY_OFFSET: u64 = 0x1010;
pub const DYNAMIC_OFFSET: u64 = 0x1100;
pub const EXCLUDED_ADDR: u64 = 0x1234;

/// Names of the sections the relocator must leave alone, all given `EXCLUDED_ADDR`.
pub const EXCLUDED_SECTIONS: &[&str] = &[
    ".comment",
    ".note.stapsdt",
    ".note.gnu.gold-version",
    ".gnu_debuglink",
    ".symtab",
    ".shstrtab",
    ".strtab",
];

/// A small position-independent shared object.
///
/// Layout: text segment at file/vaddr 0 (dynsym, dynstr, rela tables, text),
/// data segment at file 0x1000 / vaddr 0x2000 (init/fini arrays, dynamic, data),
/// then non-alloc sections and the section header table.
pub struct DylibFixture {
    /// Extra `.symtab`-only symbols as `(name, value, shndx)`.
    pub extra_symbols: Vec<(String, u64, u16)>,
}

impl Default for DylibFixture {
    fn default() -> Self {
        Self {
            extra_symbols: vec![
                ("_SafeFetch32_fault".to_string(), 0x610, 5),
                ("_SafeFetch32_continuation".to_string(), 0x618, 5),
                ("gHotSpotVMTypes".to_string(), 0x2480, 9),
            ],
        }
    }
}

fn sym(name: u32, kind: u8, shndx: u16, value: u64) -> SymbolEntry {
    SymbolEntry {
        st_name: name,
        st_info: (STB_GLOBAL << 4) | kind,
        st_other: 0,
        st_shndx: shndx,
        st_value: value,
        st_size: 8,
    }
}

impl DylibFixture {
    pub fn write(&self) -> TempPath {
        let path = unique_path("dylib");
        std::fs::write(&path, self.build()).unwrap();
        path
    }

    pub fn build(&self) -> Vec<u8> {
        let mut blob = Blob::default();

        let mut dynstr = StrTab::new();
        let n_func = dynstr.add("func");
        let n_structs = dynstr.add("gHotSpotVMStructs");
        let n_undef = dynstr.add("undef_func");
        let n_abs = dynstr.add("abs_sym");
        let n_tls = dynstr.add("tls_var");
        let n_libc = dynstr.add("libc.so.6");

        let dyn_syms = vec![
            SymbolEntry::default(),
            sym(n_func, STT_FUNC, 5, 0x600),
            sym(n_structs, STT_OBJECT, 9, 0x2400),
            sym(n_undef, STT_FUNC, SHN_UNDEF as u16, 0),
            sym(n_abs, STT_OBJECT, SHN_ABS as u16, 0x42),
            sym(n_tls, STT_TLS, 9, 0x10),
        ];

        let mut strtab = StrTab::new();
        let mut symtab = dyn_syms.clone();
        let renames = [n_func, n_structs, n_undef, n_abs, n_tls];
        for (entry, old) in symtab.iter_mut().skip(1).zip(renames) {
            let name = crate::sections::name_at(&dynstr.0, old).to_string();
            entry.st_name = strtab.add(&name);
        }
        for (name, value, shndx) in &self.extra_symbols {
            symtab.push(sym(strtab.add(name), STT_FUNC, *shndx, *value));
        }

        let relative = arch::RELATIVE_KINDS[0] as u64;
        let absolute = arch::ABSOLUTE_KIND as u64;
        let rela_dyn = [
            RelocationEntry { r_offset: INIT_ARRAY_VADDR, r_info: relative, r_addend: 0x600 },
            RelocationEntry { r_offset: 0x2400, r_info: relative, r_addend: 0x2408 },
            RelocationEntry { r_offset: 0x2410, r_info: absolute, r_addend: 0x600 },
            RelocationEntry { r_offset: 0x2418, r_info: (2 << 32) | absolute, r_addend: 8 },
        ];
        let rela_plt = [RelocationEntry { r_offset: 0x2420, r_info: (3 << 32) | absolute, r_addend: 0 }];

        let dynamic = [
            (DT_NEEDED, n_libc as u64),
            (DT_INIT, 0x600),
            (DT_FINI, 0x608),
            (DT_GNU_HASH, 0x180),
            (DT_STRTAB, 0x300),
            (DT_SYMTAB, DYNSYM_OFFSET),
            (DT_STRSZ, dynstr.0.len() as u64),
            (DT_SYMENT, SYM_SIZE as u64),
            (DT_RELA, RELA_DYN_OFFSET),
            (DT_RELASZ, (rela_dyn.len() * RELA_SIZE) as u64),
            (DT_JMPREL, RELA_PLT_OFFSET),
            (DT_PLTGOT, 0x2300),
            (DT_INIT_ARRAY, INIT_ARRAY_VADDR),
            (DT_INIT_ARRAYSZ, 16),
            (DT_FINI_ARRAY, FINI_ARRAY_VADDR),
            (DT_FINI_ARRAYSZ, 8),
            (DT_NULL, 0),
        ];

        // Segment contents.
        for (i, s) in dyn_syms.iter().enumerate() {
            blob.put(DYNSYM_OFFSET + (i * SYM_SIZE) as u64, &s.to_bytes());
        }
        blob.put(0x300, &dynstr.0);
        for (i, r) in rela_dyn.iter().enumerate() {
            blob.put(RELA_DYN_OFFSET + (i * RELA_SIZE) as u64, &r.to_bytes());
        }
        for (i, r) in rela_plt.iter().enumerate() {
            blob.put(RELA_PLT_OFFSET + (i * RELA_SIZE) as u64, &r.to_bytes());
        }
        blob.put(0x600, &[0xc3; 0x100]);
        blob.put(INIT_ARRAY_OFFSET, &0x600u64.to_le_bytes());
        blob.put(INIT_ARRAY_OFFSET + 8, &0u64.to_le_bytes());
        blob.put(FINI_ARRAY_OFFSET, &0x608u64.to_le_bytes());
        for (i, (tag, val)) in dynamic.iter().enumerate() {
            let entry = DynamicEntry { d_tag: *tag, d_val: *val };
            blob.put(DYNAMIC_OFFSET + (i * DYN_SIZE) as u64, &entry.to_bytes());
        }
        blob.put(0x1400, &[0x5a; 0x100]);

        // Non-alloc sections.
        let mut shstrtab = StrTab::new();
        let mut sections: Vec<SectionHeader> = vec![SectionHeader::default()];
        let mut add = |name: &str, sh: SectionHeader| {
            let mut sh = sh;
            sh.sh_name = shstrtab.add(name);
            sections.push(sh);
        };
        let alloc = |sh_type, addr, offset, size, entsize, link| SectionHeader {
            sh_type,
            sh_flags: SHF_ALLOC as u64,
            sh_addr: addr,
            sh_offset: offset,
            sh_size: size,
            sh_link: link,
            sh_addralign: 8,
            sh_entsize: entsize,
            ..Default::default()
        };
        let other = |sh_type, offset, size, entsize, link| SectionHeader {
            sh_type,
            sh_addr: EXCLUDED_ADDR,
            sh_offset: offset,
            sh_size: size,
            sh_link: link,
            sh_addralign: 1,
            sh_entsize: entsize,
            ..Default::default()
        };

        let sym_bytes = |syms: &[SymbolEntry]| -> Vec<u8> {
            syms.iter().flat_map(|s| s.to_bytes()).collect()
        };
        let symtab_bytes = sym_bytes(&symtab);
        blob.put(0x2000, b"GCC: (GNU) 13\0");
        blob.put(0x2100, &symtab_bytes);
        let strtab_offset = 0x2100 + symtab_bytes.len() as u64;
        blob.put(strtab_offset, &strtab.0);
        let debuglink_offset = strtab_offset + strtab.0.len() as u64;
        blob.put(debuglink_offset, b"lib.debug\0\0\0\0\0\0\0");

        // 1..=9: allocated sections
        add(".dynsym", alloc(SHT_DYNSYM, DYNSYM_OFFSET, DYNSYM_OFFSET, (dyn_syms.len() * SYM_SIZE) as u64, SYM_SIZE as u64, 2));
        add(".dynstr", alloc(SHT_STRTAB, 0x300, 0x300, dynstr.0.len() as u64, 0, 0));
        add(".rela.dyn", alloc(SHT_RELA, RELA_DYN_OFFSET, RELA_DYN_OFFSET, (rela_dyn.len() * RELA_SIZE) as u64, RELA_SIZE as u64, 1));
        add(".rela.plt", alloc(SHT_RELA, RELA_PLT_OFFSET, RELA_PLT_OFFSET, (rela_plt.len() * RELA_SIZE) as u64, RELA_SIZE as u64, 1));
        add(".text", alloc(SHT_PROGBITS, 0x600, 0x600, 0x100, 0, 0));
        add(".init_array", alloc(SHT_INIT_ARRAY, INIT_ARRAY_VADDR, INIT_ARRAY_OFFSET, 16, 8, 0));
        add(".fini_array", alloc(SHT_FINI_ARRAY, FINI_ARRAY_VADDR, FINI_ARRAY_OFFSET, 8, 8, 0));
        add(".dynamic", alloc(SHT_DYNAMIC, 0x2100, DYNAMIC_OFFSET, (dynamic.len() * DYN_SIZE) as u64, DYN_SIZE as u64, 2));
        add(".data", alloc(SHT_PROGBITS, 0x2400, 0x1400, 0x100, 0, 0));
        // 10..: non-alloc sections
        add(".comment", other(SHT_PROGBITS, 0x2000, 14, 1, 0));
        add(".note.stapsdt", other(SHT_NOTE, 0x2000, 0, 0, 0));
        add(".note.gnu.gold-version", other(SHT_NOTE, 0x2000, 0, 0, 0));
        add(".gnu_debuglink", other(SHT_PROGBITS, debuglink_offset, 16, 0, 0));
        let strtab_index = 15;
        add(".symtab", other(SHT_SYMTAB, 0x2100, symtab_bytes.len() as u64, SYM_SIZE as u64, strtab_index));
        add(".strtab", other(SHT_STRTAB, strtab_offset, strtab.0.len() as u64, 0, 0));
        let shstrndx = 16u16;
        let name = shstrtab.add(".shstrtab");
        let shstrtab_offset = debuglink_offset + 16;
        let shstrtab_len = shstrtab.0.len() as u64;
        sections.push(SectionHeader {
            sh_name: name,
            ..other(SHT_STRTAB, shstrtab_offset, shstrtab_len, 0, 0)
        });
        blob.put(shstrtab_offset, &shstrtab.0);

        let shoff = (shstrtab_offset + shstrtab_len + 7) & !7;
        for (i, sh) in sections.iter().enumerate() {
            blob.put(shoff + (i * SHDR_SIZE) as u64, &sh.to_bytes());
        }

        let phdrs = [
            ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_X,
                p_offset: 0,
                p_vaddr: 0,
                p_paddr: 0,
                p_filesz: 0x1000,
                p_memsz: 0x1000,
                p_align: 0x1000,
            },
            ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W,
                p_offset: 0x1000,
                p_vaddr: 0x2000,
                p_paddr: 0x2000,
                p_filesz: 0x1000,
                p_memsz: 0x1800,
                p_align: 0x1000,
            },
            ProgramHeader {
                p_type: PT_DYNAMIC,
                p_flags: PF_R | PF_W,
                p_offset: DYNAMIC_OFFSET,
                p_vaddr: 0x2100,
                p_paddr: 0x2100,
                p_filesz: (dynamic.len() * DYN_SIZE) as u64,
                p_memsz: (dynamic.len() * DYN_SIZE) as u64,
                p_align: 8,
            },
            ProgramHeader {
                p_type: PT_GNU_STACK,
                p_flags: PF_R | PF_W,
                p_align: 16,
                ..Default::default()
            },
        ];
        for (i, ph) in phdrs.iter().enumerate() {
            blob.put(64 + (i * PHDR_SIZE) as u64, &ph.to_bytes());
        }
        blob.put(
            0,
            &ehdr(ET_DYN, phdrs.len() as u16, shoff, sections.len() as u16, shstrndx, ENTRY),
        );
        blob.0
    }
}

/// One `PT_LOAD` of a synthetic core: `(vaddr, filesz, memsz, flags)`.
pub type CoreLoad = (u64, u64, u64, u32);

/// One NT_FILE entry: `(start, end, page_offset, path)`.
pub type CoreFile = (u64, u64, u64, &'static str);

pub const CORE_PAGE_SIZE: u64 = 0x1000;

/// A core dump with one `PT_NOTE` (an NT_PRSTATUS-like filler note, then
/// NT_FILE) followed by the given loads. Load contents are filled with the
/// low byte of their index plus one.
pub struct CoreFixture {
    pub loads: Vec<CoreLoad>,
    pub files: Vec<CoreFile>,
    pub with_file_note: bool,
}

fn note(blob: &mut Vec<u8>, n_type: u32, name: &[u8], desc: &[u8]) {
    blob.extend_from_slice(&(name.len() as u32).to_le_bytes());
    blob.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    blob.extend_from_slice(&n_type.to_le_bytes());
    blob.extend_from_slice(name);
    blob.resize((blob.len() + 3) & !3, 0);
    blob.extend_from_slice(desc);
    blob.resize((blob.len() + 3) & !3, 0);
}

pub fn nt_file_descriptor(files: &[CoreFile], page_size: u64) -> Vec<u8> {
    let mut desc = Vec::new();
    desc.extend_from_slice(&(files.len() as u64).to_le_bytes());
    desc.extend_from_slice(&page_size.to_le_bytes());
    for (start, end, pgoff, _) in files {
        desc.extend_from_slice(&start.to_le_bytes());
        desc.extend_from_slice(&end.to_le_bytes());
        desc.extend_from_slice(&pgoff.to_le_bytes());
    }
    for (_, _, _, path) in files {
        desc.extend_from_slice(path.as_bytes());
        desc.push(0);
    }
    desc
}

impl CoreFixture {
    pub fn new(loads: Vec<CoreLoad>, files: Vec<CoreFile>) -> Self {
        Self {
            loads,
            files,
            with_file_note: true,
        }
    }

    pub fn write(&self) -> TempPath {
        let path = unique_path("core");
        std::fs::write(&path, self.build()).unwrap();
        path
    }

    pub fn build(&self) -> Vec<u8> {
        let mut notes = Vec::new();
        // NT_PRSTATUS stand-in with an odd-sized name and descriptor to exercise padding.
        note(&mut notes, 1, b"CORE\0", &[0xab; 13]);
        if self.with_file_note {
            note(
                &mut notes,
                crate::note::NT_FILE,
                b"CORE\0",
                &nt_file_descriptor(&self.files, CORE_PAGE_SIZE),
            );
        }

        let phnum = 1 + self.loads.len();
        let notes_offset = 64 + (phnum * PHDR_SIZE) as u64;
        let mut data_offset = (notes_offset + notes.len() as u64 + 0xfff) & !0xfff;

        let mut blob = Blob::default();
        blob.put(0, &ehdr(ET_CORE, phnum as u16, 0, 0, 0, 0));
        let note_ph = ProgramHeader {
            p_type: PT_NOTE,
            p_offset: notes_offset,
            p_filesz: notes.len() as u64,
            p_align: 1,
            ..Default::default()
        };
        blob.put(64, &note_ph.to_bytes());
        blob.put(notes_offset, &notes);

        for (i, (vaddr, filesz, memsz, flags)) in self.loads.iter().enumerate() {
            let ph = ProgramHeader {
                p_type: PT_LOAD,
                p_flags: *flags,
                p_offset: data_offset,
                p_vaddr: *vaddr,
                p_paddr: 0,
                p_filesz: *filesz,
                p_memsz: *memsz,
                p_align: CORE_PAGE_SIZE,
            };
            blob.put(64 + ((i + 1) * PHDR_SIZE) as u64, &ph.to_bytes());
            blob.put(data_offset, &vec![(i + 1) as u8; *filesz as usize]);
            data_offset += *filesz;
        }
        blob.0
    }
}

pub const RW: u32 = PF_R | PF_W;
pub const RO: u32 = PF_R;
