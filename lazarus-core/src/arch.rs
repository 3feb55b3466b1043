//! Per-architecture constants for the build target.

#[cfg(target_arch = "x86_64")]
mod consts {
    use goblin::elf::header::EM_X86_64;
    use goblin::elf::reloc::{R_X86_64_64, R_X86_64_IRELATIVE, R_X86_64_RELATIVE};

    pub const EM_HOST: u16 = EM_X86_64;

    /// First address above the user half of a 47-bit address space.
    pub const USER_ADDRESS_LIMIT: u64 = 0x0000_8000_0000_0000;

    pub const RELATIVE_KINDS: &[u32] = &[R_X86_64_RELATIVE, R_X86_64_IRELATIVE];
    pub const ABSOLUTE_KIND: u32 = R_X86_64_64;
}

#[cfg(target_arch = "aarch64")]
mod consts {
    use goblin::elf::header::EM_AARCH64;
    use goblin::elf::reloc::{R_AARCH64_ABS64, R_AARCH64_IRELATIVE, R_AARCH64_RELATIVE};

    pub const EM_HOST: u16 = EM_AARCH64;

    /// First address above the user half of a 48-bit address space.
    pub const USER_ADDRESS_LIMIT: u64 = 0x0001_0000_0000_0000;

    pub const RELATIVE_KINDS: &[u32] = &[R_AARCH64_RELATIVE, R_AARCH64_IRELATIVE];
    pub const ABSOLUTE_KIND: u32 = R_AARCH64_ABS64;
}

pub use consts::*;

/// Whether a relocation's addend holds an absolute address that moves with the base.
pub fn addend_is_address(kind: u32, sym: u32) -> bool {
    RELATIVE_KINDS.contains(&kind) || (kind == ABSOLUTE_KIND && sym == 0)
}

pub fn machine_name(machine: u16) -> &'static str {
    goblin::elf::header::machine_to_str(machine)
}
