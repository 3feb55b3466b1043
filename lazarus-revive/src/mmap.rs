//! Fixed-address mappings with fallbacks for file offsets the kernel refuses.

use crate::error::{Result, RevivalError};
use goblin::elf::program_header::{PF_R, PF_W, PF_X};
use std::io;
use std::os::fd::RawFd;
use std::sync::OnceLock;

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

pub fn page_floor(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

pub fn page_ceil(addr: usize) -> usize {
    page_floor(addr + page_size() - 1)
}

/// `PROT_*` bits for `PF_*` segment flags.
pub fn prot_for_flags(flags: u32) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if flags & PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

fn map_error(addr: usize, len: usize, source: io::Error) -> RevivalError {
    RevivalError::Map { addr, len, source }
}

unsafe fn raw_mmap(
    addr: usize,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: RawFd,
    offset: u64,
) -> io::Result<()> {
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            prot,
            flags | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Maps `len` bytes of `fd` at `offset` to exactly `addr`.
///
/// When the kernel rejects the request with `EINVAL` the offset is rounded
/// down to a page and the mapping grown by the difference, as long as that
/// keeps the address page aligned. Failing that, the range is mapped
/// anonymous and the bytes are read in with `pread`, then given `prot`.
///
/// # Safety
///
/// Replaces whatever is mapped in the affected pages.
pub unsafe fn do_mmap(
    addr: usize,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: RawFd,
    offset: u64,
) -> Result<usize> {
    let err = match unsafe { raw_mmap(addr, len, prot, flags, fd, offset) } {
        Ok(()) => return Ok(addr),
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => err,
        Err(err) => return Err(map_error(addr, len, err)),
    };
    log::debug!("mmap {addr:#x}+{len:#x} at offset {offset:#x}: {err}");

    let shift = (offset % page_size() as u64) as usize;
    if shift != 0 && addr >= shift && (addr - shift) % page_size() == 0 {
        let aligned = addr - shift;
        match unsafe { raw_mmap(aligned, len + shift, prot, flags, fd, offset - shift as u64) } {
            Ok(()) => {
                log::warn!("Mapped {addr:#x} from aligned offset {:#x}", offset - shift as u64);
                return Ok(addr);
            }
            Err(err) => log::debug!("aligned mmap at {aligned:#x}: {err}"),
        }
    }

    log::warn!("Copying {len:#x} bytes to {addr:#x} instead of mapping them");
    unsafe { copy_in(addr, len, prot, fd, offset) }?;
    Ok(addr)
}

unsafe fn copy_in(addr: usize, len: usize, prot: libc::c_int, fd: RawFd, offset: u64) -> Result<()> {
    let start = page_floor(addr);
    let span = page_ceil(addr + len) - start;
    unsafe { map_anonymous(start, span, libc::PROT_READ | libc::PROT_WRITE) }?;

    let dest = unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, len) };
    let mut done = 0usize;
    while done < len {
        let ret = unsafe {
            libc::pread(
                fd,
                dest[done..].as_mut_ptr() as *mut libc::c_void,
                len - done,
                (offset + done as u64) as libc::off_t,
            )
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(map_error(addr, len, err));
        }
        if ret == 0 {
            return Err(map_error(
                addr,
                len,
                io::Error::new(io::ErrorKind::UnexpectedEof, "file ends inside the mapping"),
            ));
        }
        done += ret as usize;
    }

    if unsafe { libc::mprotect(start as *mut libc::c_void, span, prot) } != 0 {
        return Err(map_error(start, span, io::Error::last_os_error()));
    }
    Ok(())
}

/// Private anonymous memory at exactly `addr`.
///
/// # Safety
///
/// Replaces whatever is mapped in the affected pages.
pub unsafe fn map_anonymous(addr: usize, len: usize, prot: libc::c_int) -> Result<()> {
    unsafe {
        raw_mmap(
            addr,
            len,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    }
    .map_err(|e| map_error(addr, len, e))
}

/// Claims an inaccessible range so nothing else lands there.
///
/// # Safety
///
/// Replaces whatever is mapped in the affected pages.
pub unsafe fn reserve(addr: usize, len: usize) -> Result<()> {
    unsafe { map_anonymous(page_floor(addr), page_ceil(addr + len) - page_floor(addr), libc::PROT_NONE) }
}
