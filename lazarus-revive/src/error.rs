use crate::context::SegmentState;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RevivalError {
    #[error(transparent)]
    Core(#[from] lazarus_core::Error),

    #[error("mapping {len:#x} bytes at {addr:#x} failed: {source}")]
    Map {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("installing the fault handler failed: {0}")]
    Signal(#[source] io::Error),

    #[error("fault handler is already installed")]
    AlreadyInstalled,

    #[error("segment at {vaddr:#x} cannot be made writable from state {state:?}")]
    State { vaddr: u64, state: SegmentState },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RevivalError>;
