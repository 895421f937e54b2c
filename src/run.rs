//! Run-block operations (C4): sub-chunk bitmap-tracked blocks.

use std::mem::size_of;

use crate::block::{BlockOp, BlockState, MemoryBlock, MemoryBlockOps};
use crate::error::corrupt;
use crate::heap::{OperationContext, RedoOp, RunMutexHandle};
use crate::layout::{chunk_flags, BITS_PER_VALUE, RUN_BITMAP_NWORDS, RUN_METASIZE};

/// A run's metadata block: fixed-size header plus its bitmap, living
/// at the start of the owning chunk's data area.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RunHeader {
    pub block_size: u64,
    pub alignment: u64,
    pub bitmap: [u64; RUN_BITMAP_NWORDS],
}

const _: () = assert!(size_of::<RunHeader>() == RUN_METASIZE);

fn run_hdr_ptr(m: &MemoryBlock) -> *mut RunHeader {
    m.heap().chunk_data_ptr(m.zone_id, m.chunk_id) as *mut RunHeader
}

/// Smallest non-negative padding such that `run_data_addr + header_size`
/// is a multiple of `alignment` — so the *user* pointer (past the
/// inline allocation header) lands aligned, not the raw block start.
///
/// `run_data_addr` must be the real virtual address of `run->data`
/// (i.e. the chunk's data pointer plus `RUN_METASIZE`), not an offset
/// relative to the chunk: the alignment is on the absolute pointer, so
/// padding computed against a chunk-relative offset is only correct
/// when the chunk's data base happens to itself be a multiple of
/// `alignment`, which does not hold in general (e.g. `HeapRegion`'s
/// `chunk_data_offset` is not a multiple of typical run alignments).
pub(crate) fn alignment_padding(run_data_addr: usize, alignment: u64, header_size: usize) -> usize {
    if alignment == 0 {
        return 0;
    }
    let align = alignment as usize;
    let target = run_data_addr + header_size;
    let aligned_up = target.div_ceil(align) * align;
    aligned_up - header_size - run_data_addr
}

fn data_start(m: &MemoryBlock, run: &RunHeader) -> *mut u8 {
    let run_data_ptr = unsafe { (run_hdr_ptr(m) as *mut u8).add(RUN_METASIZE) };
    let chunk_hdr = unsafe { *m.heap().chunk_hdr_ptr(m.zone_id, m.chunk_id) };
    if chunk_hdr.flags & chunk_flags::ALIGNED != 0 {
        let padding = alignment_padding(run_data_ptr as usize, run.alignment, m.header_type.header_size());
        unsafe { run_data_ptr.add(padding) }
    } else {
        run_data_ptr
    }
}

fn block_size(m: &MemoryBlock) -> u64 {
    unsafe { (*run_hdr_ptr(m)).block_size }
}

fn get_real_data(m: &MemoryBlock) -> *mut u8 {
    let run = unsafe { *run_hdr_ptr(m) };
    let base = data_start(m, &run);
    unsafe { base.add(run.block_size as usize * m.block_off as usize) }
}

fn get_state(m: &MemoryBlock) -> BlockState {
    let run = unsafe { &*run_hdr_ptr(m) };
    // Literal size_idx, not clamped to 1: a descriptor resolved with
    // `want_size = false` leaves `size_idx == 0`, an empty bit range,
    // which must report FREE rather than consulting an arbitrary bit.
    let size_idx = m.size_idx;
    let word_idx = (m.block_off / BITS_PER_VALUE) as usize;
    let bit0 = m.block_off % BITS_PER_VALUE;
    if word_idx >= RUN_BITMAP_NWORDS {
        corrupt(format!("run bitmap word index {word_idx} out of range"));
    }
    let word = run.bitmap[word_idx];
    let mut any_set = false;
    for i in bit0..bit0 + size_idx {
        if i >= BITS_PER_VALUE {
            corrupt("run allocation crosses a bitmap word boundary");
        }
        if word & (1u64 << i) != 0 {
            any_set = true;
            break;
        }
    }
    if any_set {
        BlockState::Allocated
    } else {
        BlockState::Free
    }
}

fn get_lock(m: &MemoryBlock) -> Option<RunMutexHandle> {
    Some(m.heap().run_lock(m.chunk_id))
}

/// No-op in release builds. In debug builds, asserts the run's chunk
/// header already carries the flag for `flavor` — runs are created
/// with their header flavor fixed at run-creation time.
fn ensure_header_type(m: &MemoryBlock, flavor: crate::layout::HeaderType) {
    log::trace!(
        "run::ensure_header_type zone={} chunk={} flavor={:?}",
        m.zone_id,
        m.chunk_id,
        flavor
    );
    if cfg!(debug_assertions) {
        let chunk_hdr = unsafe { *m.heap().chunk_hdr_ptr(m.zone_id, m.chunk_id) };
        if let Some(flag) = flavor.flag_bit() {
            debug_assert!(
                chunk_hdr.flags & flag != 0,
                "run chunk does not carry the expected header-flavor flag"
            );
        }
    }
}

/// Bitmap flip, per §4.3. No read-before-write: the OR/AND operations
/// composed by the redo log are value-independent given the mask, as
/// long as the caller holds the run mutex across `prep_hdr` and the
/// context's commit.
fn prep_hdr(m: &MemoryBlock, op: BlockOp, ctx: Option<&mut dyn OperationContext>) {
    log::debug!(
        "run::prep_hdr zone={} chunk={} block_off={} op={:?}",
        m.zone_id,
        m.chunk_id,
        m.block_off,
        op
    );
    let size_idx = m.size_idx;
    assert!(size_idx <= BITS_PER_VALUE, "run size_idx must fit in one bitmap word");
    if size_idx == BITS_PER_VALUE {
        assert_eq!(m.block_off % BITS_PER_VALUE, 0, "a full-word run must be word-aligned");
    }

    let bit0 = m.block_off % BITS_PER_VALUE;
    let bmask: u64 = if size_idx == BITS_PER_VALUE {
        u64::MAX
    } else {
        ((1u64 << size_idx) - 1) << bit0
    };

    let word_idx = (m.block_off / BITS_PER_VALUE) as usize;
    let word_ptr = unsafe { (run_hdr_ptr(m) as *mut u8).add(16 + word_idx * 8) } as *mut u64;

    let ctx = ctx.expect("run prep_hdr requires a redo-log context");
    match op {
        BlockOp::Allocated => unsafe { ctx.add_entry(word_ptr, bmask, RedoOp::Or) },
        BlockOp::Free => unsafe { ctx.add_entry(word_ptr, !bmask, RedoOp::And) },
    }
}

pub static RUN_OPS: MemoryBlockOps = MemoryBlockOps {
    block_size,
    get_real_data,
    get_state,
    get_lock,
    ensure_header_type,
    prep_hdr,
};
