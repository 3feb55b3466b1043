//! Runtime half of a revival: replays a core's memory into the current
//! process and services the faults that follow.

pub mod arch;
pub mod context;
pub mod error;
pub mod handler;
pub mod loader;
pub mod mmap;
pub mod scratch;
pub mod worker;

pub use context::{FaultAction, RevivalContext, SegmentState, Trampoline};
pub use error::{Result, RevivalError};
pub use handler::install;
pub use loader::{map_segments, MapSummary};
pub use mmap::do_mmap;

use std::path::Path;

/// Installs the fault handler, then brings the memory of `core` back into
/// this process from the revival directory `dir`.
///
/// The handler goes in first so an access racing with the mapping already
/// sees the segment states. The returned context lives for the rest of the
/// process.
pub fn revive(dir: &Path, core: &Path) -> Result<&'static RevivalContext> {
    lazarus_core::require_load_bias()?;
    let ctx: &'static RevivalContext = Box::leak(Box::new(RevivalContext::load(dir, core)?));
    install(ctx)?;
    map_segments(ctx)?;
    Ok(ctx)
}
