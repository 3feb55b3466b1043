//! Replays a mapping descriptor into the current address space.

use crate::context::{RevivalContext, SegmentState};
use crate::error::Result;
use crate::mmap::{do_mmap, map_anonymous, page_ceil, prot_for_flags, reserve};
use lazarus_core::Segment;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapSummary {
    pub mapped: usize,
    pub copy_on_write: usize,
    pub failed: usize,
}

unsafe fn map_segment(ctx: &RevivalContext, segment: &Segment) -> Result<()> {
    let start = segment.vaddr as usize;
    let end = segment.end() as usize;
    let prot = prot_for_flags(segment.flags);

    if segment.file_size > 0 {
        let file_prot = if segment.is_writable() {
            prot & !libc::PROT_WRITE
        } else {
            prot
        };
        unsafe {
            do_mmap(
                start,
                segment.file_size as usize,
                file_prot,
                libc::MAP_PRIVATE,
                ctx.core_fd(),
                segment.file_offset,
            )
        }?;
    }

    let tail = page_ceil(start + segment.file_size as usize);
    if tail < end {
        unsafe { map_anonymous(tail, page_ceil(end) - tail, prot) }?;
    }
    Ok(())
}

/// Maps every segment of `ctx` from the core file.
///
/// Writable segments start out read-only so that their first write faults
/// and is redirected to the scratch file. A segment that cannot be mapped is
/// reserved inaccessible and marked failed; the rest still get mapped.
pub fn map_segments(ctx: &RevivalContext) -> Result<MapSummary> {
    let mut summary = MapSummary::default();
    for slot in ctx.segments() {
        let segment = slot.segment();
        match unsafe { map_segment(ctx, segment) } {
            Ok(()) if segment.is_writable() => {
                slot.set_state(SegmentState::CopyOnWrite);
                summary.copy_on_write += 1;
            }
            Ok(()) => {
                slot.set_state(SegmentState::Mapped);
                summary.mapped += 1;
            }
            Err(e) => {
                log::error!("Segment {:#x}: {e}", segment.vaddr);
                unsafe { reserve(segment.vaddr as usize, segment.mem_size as usize) }?;
                slot.set_state(SegmentState::Failed);
                summary.failed += 1;
            }
        }
        log::debug!("{:#x}+{:#x}: {:?}", segment.vaddr, segment.mem_size, slot.state());
    }
    log::info!(
        "Mapped {} segments from {}: {} read-only, {} copy-on-write, {} failed",
        ctx.segments().len(),
        ctx.core_path().display(),
        summary.mapped,
        summary.copy_on_write,
        summary.failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::core_file;
    use crate::error::RevivalError;
    use crate::mmap::page_size;
    use crate::mmap::tests::{pattern, scratch_region, unique_path, TempPath};
    use goblin::elf::program_header::{PF_R, PF_W};
    use std::fs;

    fn bytes_at(addr: usize, len: usize) -> &'static [u8] {
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }
    }

    struct Revived {
        ctx: RevivalContext,
        core: Vec<u8>,
        base: usize,
        _files: [TempPath; 2],
    }

    /// One writable segment with a zero-filled tail and one read-only one.
    fn revived() -> Revived {
        let page = page_size();
        let core = pattern(4 * page);
        let base = scratch_region(4 * page);
        let segments = vec![
            Segment {
                vaddr: base as u64,
                mem_size: 2 * page as u64,
                file_offset: page as u64,
                file_size: page as u64,
                flags: PF_R | PF_W,
            },
            Segment {
                vaddr: (base + 2 * page) as u64,
                mem_size: page as u64,
                file_offset: 2 * page as u64,
                file_size: page as u64,
                flags: PF_R,
            },
        ];
        let core_path = core_file(&core);
        let scratch = unique_path("scratch");
        let ctx =
            RevivalContext::new(&core_path, segments, vec![], scratch.to_path_buf()).unwrap();
        Revived {
            ctx,
            core,
            base,
            _files: [core_path, scratch],
        }
    }

    #[test]
    fn segments_are_replayed_from_the_core() {
        let page = page_size();
        let Revived { ctx, core, base, _files } = revived();

        let summary = map_segments(&ctx).unwrap();
        assert_eq!(
            summary,
            MapSummary {
                mapped: 1,
                copy_on_write: 1,
                failed: 0
            }
        );
        assert_eq!(bytes_at(base, page), &core[page..2 * page]);
        assert!(bytes_at(base + page, page).iter().all(|&b| b == 0));
        assert_eq!(bytes_at(base + 2 * page, page), &core[2 * page..3 * page]);
        assert_eq!(ctx.segments()[0].state(), SegmentState::CopyOnWrite);
        assert_eq!(ctx.segments()[1].state(), SegmentState::Mapped);
        assert!(!ctx.scratch().path().exists());
    }

    #[test]
    fn materialized_segments_accept_writes_and_leave_the_core_alone() {
        let page = page_size();
        let Revived { ctx, core, base, _files } = revived();
        map_segments(&ctx).unwrap();

        ctx.materialize(0).unwrap();
        assert_eq!(ctx.segments()[0].state(), SegmentState::Writable);
        assert_eq!(bytes_at(base, page), &core[page..2 * page]);

        unsafe { std::ptr::write_volatile(base as *mut u8, 0xee) };
        assert_eq!(bytes_at(base, 1), &[0xee]);

        assert_eq!(fs::read(ctx.core_path()).unwrap(), core);
        assert_eq!(&fs::read(ctx.scratch().path()).unwrap()[..page], &core[page..2 * page]);

        // A second request for the same segment finds it done.
        ctx.materialize(0).unwrap();
        assert!(matches!(
            ctx.materialize(1),
            Err(RevivalError::State {
                state: SegmentState::Mapped,
                ..
            })
        ));
    }
}
