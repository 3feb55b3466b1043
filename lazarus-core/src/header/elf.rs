use crate::header::Header;
pub use crate::layout::EHDR_SIZE;
use crate::layout::EHDR_FIELDS;
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use goblin::elf::header::{et_to_str, ET_CORE, ET_DYN};
use std::io;

/// Byte offset of `e_entry` inside the header.
pub const E_ENTRY_OFFSET: usize = EHDR_FIELDS[4].0;

/// Value of `e_phnum` announcing an extended program-header count.
pub const PN_XNUM: u16 = 0xffff;

/// Represents the ELF (Executable and Linkable Format) header for a 64-bit object file.
///
/// This structure corresponds to the standard `Elf64_Ehdr` defined in the ELF specification.
/// It appears at the very beginning of every ELF file and contains metadata describing
/// the file's organization and layout. It is decoded field by field from little-endian
/// bytes and encoded back the same way, so host struct padding never matters.
///
/// Reference: [ELF Specification v1.2](https://refspecs.linuxfoundation.org/elf/elf.pdf)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Ehdr {
    /// ELF identification bytes (magic number and other information).
    ///
    /// The first 4 bytes should be `0x7F`, `'E'`, `'L'`, `'F'`.
    /// Remaining bytes encode class (32/64-bit), endianness, and version.
    pub e_ident: [u8; 16],

    /// Object file type.
    ///
    /// The two this crate works with:
    /// - `ET_DYN` (3): Shared object, the library that gets relocated
    /// - `ET_CORE` (4): Core dump, the source of the replayed memory
    pub e_type: u16,

    /// Target architecture (e.g., x86_64, ARM).
    ///
    /// Common values:
    /// - `EM_X86_64` (62)
    /// - `EM_AARCH64` (183)
    pub e_machine: u16,

    /// ELF version (usually set to `EV_CURRENT` = 1).
    pub e_version: u32,

    /// Virtual address of the program entry point, zero when there is none.
    pub e_entry: u64,

    /// File offset of the program header table.
    pub e_phoff: u64,

    /// File offset of the section header table.
    pub e_shoff: u64,

    /// Processor-specific flags.
    pub e_flags: u32,

    /// Size of this ELF header (usually `64` bytes for ELF64).
    pub e_ehsize: u16,

    /// Size of one entry in the program header table.
    pub e_phentsize: u16,

    /// Number of entries in the program header table.
    pub e_phnum: u16,

    /// Size of one entry in the section header table.
    pub e_shentsize: u16,

    /// Number of entries in the section header table.
    pub e_shnum: u16,

    /// Index of the section header string table.
    ///
    /// This section contains the names of all other sections.
    pub e_shstrndx: u16,
}

impl Header for Elf64Ehdr {
    fn machine(&self) -> u16 {
        self.e_machine
    }

    fn type_name(&self) -> &'static str {
        et_to_str(self.e_type)
    }

    fn is_shared_object(&self) -> bool {
        self.e_type == ET_DYN
    }

    fn is_core(&self) -> bool {
        self.e_type == ET_CORE
    }
}

impl Elf64Ehdr {
    pub fn from_reader<R: io::Read>(cur: &mut R) -> io::Result<Elf64Ehdr> {
        let mut e_ident = [0u8; 16];
        cur.read_exact(&mut e_ident)?;

        Ok(Elf64Ehdr {
            e_ident,
            e_type: cur.read_u16::<LE>()?,
            e_machine: cur.read_u16::<LE>()?,
            e_version: cur.read_u32::<LE>()?,
            e_entry: cur.read_u64::<LE>()?,
            e_phoff: cur.read_u64::<LE>()?,
            e_shoff: cur.read_u64::<LE>()?,
            e_flags: cur.read_u32::<LE>()?,
            e_ehsize: cur.read_u16::<LE>()?,
            e_phentsize: cur.read_u16::<LE>()?,
            e_phnum: cur.read_u16::<LE>()?,
            e_shentsize: cur.read_u16::<LE>()?,
            e_shnum: cur.read_u16::<LE>()?,
            e_shstrndx: cur.read_u16::<LE>()?,
        })
    }

    pub fn to_writer<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.e_ident)?;
        out.write_u16::<LE>(self.e_type)?;
        out.write_u16::<LE>(self.e_machine)?;
        out.write_u32::<LE>(self.e_version)?;
        out.write_u64::<LE>(self.e_entry)?;
        out.write_u64::<LE>(self.e_phoff)?;
        out.write_u64::<LE>(self.e_shoff)?;
        out.write_u32::<LE>(self.e_flags)?;
        out.write_u16::<LE>(self.e_ehsize)?;
        out.write_u16::<LE>(self.e_phentsize)?;
        out.write_u16::<LE>(self.e_phnum)?;
        out.write_u16::<LE>(self.e_shentsize)?;
        out.write_u16::<LE>(self.e_shnum)?;
        out.write_u16::<LE>(self.e_shstrndx)
    }

    pub fn to_bytes(&self) -> [u8; EHDR_SIZE] {
        let mut buf = [0u8; EHDR_SIZE];
        let written = self.to_writer(&mut &mut buf[..]);
        debug_assert!(written.is_ok(), "EHDR_SIZE bytes hold one header");
        buf
    }
}
