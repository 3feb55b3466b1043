//! On-disk record layouts, as `(offset, width)` pairs in field order.
//!
//! Every decoder reads its fields in exactly this order and every encoder
//! writes them back the same way; the assertions below pin the tables to
//! the record sizes at compile time.

pub type FieldTable = &'static [(usize, usize)];

pub const EHDR_SIZE: usize = 64;
pub const EHDR_FIELDS: FieldTable = &[
    (0, 16),  // e_ident
    (16, 2),  // e_type
    (18, 2),  // e_machine
    (20, 4),  // e_version
    (24, 8),  // e_entry
    (32, 8),  // e_phoff
    (40, 8),  // e_shoff
    (48, 4),  // e_flags
    (52, 2),  // e_ehsize
    (54, 2),  // e_phentsize
    (56, 2),  // e_phnum
    (58, 2),  // e_shentsize
    (60, 2),  // e_shnum
    (62, 2),  // e_shstrndx
];

pub const PHDR_SIZE: usize = 56;
pub const PHDR_FIELDS: FieldTable = &[
    (0, 4),  // p_type
    (4, 4),  // p_flags
    (8, 8),  // p_offset
    (16, 8), // p_vaddr
    (24, 8), // p_paddr
    (32, 8), // p_filesz
    (40, 8), // p_memsz
    (48, 8), // p_align
];

pub const SHDR_SIZE: usize = 64;
pub const SHDR_FIELDS: FieldTable = &[
    (0, 4),  // sh_name
    (4, 4),  // sh_type
    (8, 8),  // sh_flags
    (16, 8), // sh_addr
    (24, 8), // sh_offset
    (32, 8), // sh_size
    (40, 4), // sh_link
    (44, 4), // sh_info
    (48, 8), // sh_addralign
    (56, 8), // sh_entsize
];

pub const DYN_SIZE: usize = 16;
pub const DYN_FIELDS: FieldTable = &[
    (0, 8), // d_tag
    (8, 8), // d_val / d_ptr
];

pub const RELA_SIZE: usize = 24;
pub const RELA_FIELDS: FieldTable = &[
    (0, 8),  // r_offset
    (8, 8),  // r_info
    (16, 8), // r_addend
];

pub const SYM_SIZE: usize = 24;
pub const SYM_FIELDS: FieldTable = &[
    (0, 4),  // st_name
    (4, 1),  // st_info
    (5, 1),  // st_other
    (6, 2),  // st_shndx
    (8, 8),  // st_value
    (16, 8), // st_size
];

/// Size of an `Elf64_Nhdr`: namesz, descsz, type.
pub const NHDR_SIZE: usize = 12;
pub const NHDR_FIELDS: FieldTable = &[(0, 4), (4, 4), (8, 4)];

const fn packed(fields: FieldTable, size: usize) -> bool {
    let mut next = 0;
    let mut i = 0;
    while i < fields.len() {
        if fields[i].0 != next {
            return false;
        }
        next += fields[i].1;
        i += 1;
    }
    next == size
}

const _: () = assert!(packed(EHDR_FIELDS, EHDR_SIZE));
const _: () = assert!(packed(PHDR_FIELDS, PHDR_SIZE));
const _: () = assert!(packed(SHDR_FIELDS, SHDR_SIZE));
const _: () = assert!(packed(DYN_FIELDS, DYN_SIZE));
const _: () = assert!(packed(RELA_FIELDS, RELA_SIZE));
const _: () = assert!(packed(SYM_FIELDS, SYM_SIZE));
const _: () = assert!(packed(NHDR_FIELDS, NHDR_SIZE));

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
