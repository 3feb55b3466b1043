//! Everything the fault handler needs, gathered before it is installed.

use crate::error::{Result, RevivalError};
use crate::mmap::{do_mmap, page_ceil, prot_for_flags};
use crate::scratch::{ScratchFile, SCRATCH_FILE};
use crate::worker::FaultQueue;
use lazarus_core::{parse_mappings, parse_symbols, Error, Segment, MAPPINGS_FILE, SYMBOLS_FILE};
use std::fs::File;
use std::io::{self, BufReader};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

/// `(fault, continuation)` symbol pairs of the runtime's SafeFetch loads.
pub const SAFEFETCH_PAIRS: [(&str, &str); 2] = [
    ("_SafeFetch32_fault", "_SafeFetch32_continuation"),
    ("_SafeFetchN_fault", "_SafeFetchN_continuation"),
];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Unmapped = 0,
    /// Mapped with its final protection.
    Mapped = 1,
    /// Writable in the core but mapped read-only from it.
    CopyOnWrite = 2,
    /// Remapped writable from the scratch file.
    Writable = 3,
    /// Could not be mapped; the range is reserved inaccessible.
    Failed = 4,
}

impl SegmentState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Mapped,
            2 => Self::CopyOnWrite,
            3 => Self::Writable,
            4 => Self::Failed,
            _ => Self::Unmapped,
        }
    }
}

pub struct SegmentSlot {
    segment: Segment,
    state: AtomicU8,
}

impl SegmentSlot {
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SegmentState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampoline {
    pub fault: usize,
    pub continuation: usize,
}

/// What the handler does about one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// A SafeFetch load faulted; continue at this address.
    Resume(usize),
    /// The segment at this index must be made writable first.
    Materialize(usize),
    /// The segment was remapped since the fault was raised.
    Retry,
    /// The segment at this index could not be mapped.
    Failed(usize),
    Unexpected,
}

pub struct RevivalContext {
    core_path: PathBuf,
    core: File,
    segments: Vec<SegmentSlot>,
    trampolines: Vec<Trampoline>,
    scratch: ScratchFile,
    faults: FaultQueue,
}

impl RevivalContext {
    pub fn new(
        core_path: &Path,
        mut segments: Vec<Segment>,
        trampolines: Vec<Trampoline>,
        scratch: impl Into<PathBuf>,
    ) -> Result<Self> {
        let core = File::open(core_path).map_err(|e| Error::io(core_path, e))?;
        segments.sort_by_key(|s| s.vaddr);
        Ok(Self {
            core_path: core_path.to_path_buf(),
            core,
            segments: segments
                .into_iter()
                .map(|segment| SegmentSlot {
                    segment,
                    state: AtomicU8::new(SegmentState::Unmapped as u8),
                })
                .collect(),
            trampolines,
            scratch: ScratchFile::new(scratch),
            faults: FaultQueue::new()?,
        })
    }

    /// Reads a revival directory written by `lazarus_core::prepare_revival`.
    pub fn load(dir: &Path, core_path: &Path) -> Result<Self> {
        let mappings_path = dir.join(MAPPINGS_FILE);
        let file = File::open(&mappings_path).map_err(|e| Error::io(&mappings_path, e))?;
        let segments = parse_mappings(&mappings_path, BufReader::new(file))?;

        let symbols_path = dir.join(SYMBOLS_FILE);
        let file = File::open(&symbols_path).map_err(|e| Error::io(&symbols_path, e))?;
        let symbols = parse_symbols(&symbols_path, BufReader::new(file))?;
        let trampolines = trampolines_from(&symbols);
        if trampolines.is_empty() {
            return Err(Error::not_found(&symbols_path, "a SafeFetch fault/continuation pair").into());
        }

        log::info!(
            "Loaded {} segments and {} trampolines from {}",
            segments.len(),
            trampolines.len(),
            dir.display()
        );
        Self::new(core_path, segments, trampolines, dir.join(SCRATCH_FILE))
    }

    pub fn core_path(&self) -> &Path {
        &self.core_path
    }

    pub fn core_fd(&self) -> RawFd {
        self.core.as_raw_fd()
    }

    pub fn segments(&self) -> &[SegmentSlot] {
        &self.segments
    }

    pub fn trampolines(&self) -> &[Trampoline] {
        &self.trampolines
    }

    pub fn scratch(&self) -> &ScratchFile {
        &self.scratch
    }

    pub fn faults(&self) -> &FaultQueue {
        &self.faults
    }

    pub fn segment_index(&self, addr: usize) -> Option<usize> {
        let addr = addr as u64;
        let index = self.segments.partition_point(|s| s.segment.vaddr <= addr);
        let index = index.checked_sub(1)?;
        self.segments[index].segment.contains(addr).then_some(index)
    }

    /// Decides how to handle a fault at `addr` raised by the instruction at `pc`.
    ///
    /// `returned_from` is the address of this thread's previous fault when the
    /// handler let the instruction run again. A fault that repeats there was
    /// not a write a writable mapping can satisfy, so it is `Unexpected`.
    ///
    /// Neither allocates nor locks.
    pub fn classify(&self, pc: usize, addr: usize, returned_from: Option<usize>) -> FaultAction {
        if let Some(t) = self.trampolines.iter().find(|t| t.fault == pc) {
            return FaultAction::Resume(t.continuation);
        }
        let Some(index) = self.segment_index(addr) else {
            return FaultAction::Unexpected;
        };
        let action = match self.segments[index].state() {
            SegmentState::Failed => return FaultAction::Failed(index),
            SegmentState::CopyOnWrite => FaultAction::Materialize(index),
            SegmentState::Writable => FaultAction::Retry,
            SegmentState::Mapped | SegmentState::Unmapped => return FaultAction::Unexpected,
        };
        if returned_from == Some(addr) {
            return FaultAction::Unexpected;
        }
        action
    }

    /// Copies a copy-on-write segment into the scratch file and maps it back
    /// writable from there. Runs on the worker thread only.
    pub fn materialize(&self, index: usize) -> Result<()> {
        let slot = self.segments.get(index).ok_or_else(|| {
            RevivalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no segment {index}"),
            ))
        })?;
        match slot.state() {
            SegmentState::Writable => return Ok(()),
            SegmentState::CopyOnWrite => {}
            state => {
                return Err(RevivalError::State {
                    vaddr: slot.segment.vaddr,
                    state,
                })
            }
        }

        let start = slot.segment.vaddr as usize;
        let len = page_ceil(start + slot.segment.file_size as usize) - start;
        let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, len) };
        let (file, offset) = self.scratch.append(bytes)?;

        let prot = prot_for_flags(slot.segment.flags) | libc::PROT_READ | libc::PROT_WRITE;
        unsafe { do_mmap(start, len, prot, libc::MAP_PRIVATE, file.as_raw_fd(), offset) }?;
        slot.set_state(SegmentState::Writable);
        log::info!("{start:#x}+{len:#x} is now writable from scratch offset {offset:#x}");
        Ok(())
    }
}

fn trampolines_from(symbols: &[(String, u64)]) -> Vec<Trampoline> {
    let address = |name: &str| {
        symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, addr)| *addr as usize)
    };
    SAFEFETCH_PAIRS
        .iter()
        .filter_map(|(fault, continuation)| {
            Some(Trampoline {
                fault: address(fault)?,
                continuation: address(continuation)?,
            })
        })
        .collect()
}
