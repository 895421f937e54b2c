//! Huge-block operations (C3): chunk-granularity allocation units.

use crate::block::{BlockOp, BlockState, MemoryBlock, MemoryBlockOps};
use crate::heap::{EntryKind, OperationContext, RedoOp, RunMutexHandle};
use crate::layout::{ChunkHeader, ChunkType, HeaderType, CHUNKSIZE};
use crate::vg;

fn hdr_ptr(m: &MemoryBlock) -> *mut ChunkHeader {
    m.heap().chunk_hdr_ptr(m.zone_id, m.chunk_id)
}

fn block_size(_m: &MemoryBlock) -> u64 {
    CHUNKSIZE as u64
}

fn get_real_data(m: &MemoryBlock) -> *mut u8 {
    m.heap().chunk_data_ptr(m.zone_id, m.chunk_id)
}

fn get_state(m: &MemoryBlock) -> BlockState {
    let hdr = unsafe { *hdr_ptr(m) };
    match hdr.detect_type() {
        Some(ChunkType::Used) => BlockState::Allocated,
        Some(ChunkType::Free) => BlockState::Free,
        _ => BlockState::Unknown,
    }
}

fn get_lock(_m: &MemoryBlock) -> Option<RunMutexHandle> {
    // Huge chunks are serialized by bucket-level protection outside
    // this subsystem.
    None
}

/// Precondition: the chunk is currently FREE. Idempotent, fail-safe
/// atomic: a single 8-byte store can't tear.
fn ensure_header_type(m: &MemoryBlock, flavor: HeaderType) {
    let ptr = hdr_ptr(m);
    let hdr = unsafe { *ptr };
    debug_assert_eq!(
        hdr.detect_type(),
        Some(ChunkType::Free),
        "ensure_header_type requires a FREE chunk"
    );
    log::trace!(
        "huge::ensure_header_type zone={} chunk={} flavor={:?}",
        m.zone_id,
        m.chunk_id,
        flavor
    );
    let flag = flavor.flag_bit().unwrap_or(0);
    let new_hdr = ChunkHeader::new(hdr.chunk_type, hdr.flags | flag, hdr.size_idx);
    if new_hdr == hdr {
        return;
    }
    unsafe {
        std::ptr::write(ptr as *mut u64, new_hdr.to_bits());
        m.heap().p_ops().persist(ptr as *const u8, 8);
    }
}

/// Header preparation with footer discipline: the head-header commit
/// strictly precedes the (transient) footer write.
fn prep_hdr(m: &MemoryBlock, op: BlockOp, ctx: Option<&mut dyn OperationContext>) {
    log::debug!(
        "huge::prep_hdr zone={} chunk={} block_off={} op={:?}",
        m.zone_id,
        m.chunk_id,
        m.block_off,
        op
    );
    let ptr = hdr_ptr(m);
    let hdr = unsafe { *ptr };
    let new_type = match op {
        BlockOp::Allocated => ChunkType::Used,
        BlockOp::Free => ChunkType::Free,
    };
    let size_idx = m.size_idx.max(1);
    let new_hdr = ChunkHeader::new(new_type as u16, hdr.flags, size_idx);

    let mut ctx = ctx;
    match ctx.as_deref_mut() {
        None => unsafe {
            std::ptr::write(ptr as *mut u64, new_hdr.to_bits());
            m.heap().p_ops().persist(ptr as *const u8, 8);
        },
        Some(ctx) => unsafe {
            ctx.add_entry(ptr as *mut u64, new_hdr.to_bits(), RedoOp::Set);
        },
    }

    if size_idx > 1 {
        vg::make_noaccess(unsafe { ptr.add(1) } as *mut u8, (size_idx as usize - 1) * 8);

        // The footer is reconstructable at heap-open and must never be
        // allowed to race ahead of the durable head-header update. On
        // the direct-store path the head has already landed, so the
        // footer can be written immediately (still non-persistent: a
        // restart reconstructs it from `size_idx`). On the redo-log
        // path the head hasn't actually landed yet — it's merely
        // queued — so the footer must go into the *same* context as a
        // transient entry, relying on the context preserving relative
        // entry order so the head is replayed first.
        let footer_ptr = unsafe { ptr.add(size_idx as usize - 1) };
        let footer = ChunkHeader::new(ChunkType::Footer as u16, 0, size_idx);
        match ctx {
            None => unsafe {
                std::ptr::write(footer_ptr as *mut u64, footer.to_bits());
            },
            Some(ctx) => unsafe {
                ctx.add_typed_entry(
                    footer_ptr as *mut u64,
                    footer.to_bits(),
                    RedoOp::Set,
                    EntryKind::Transient,
                );
            },
        }
    }
}

pub static HUGE_OPS: MemoryBlockOps = MemoryBlockOps {
    block_size,
    get_real_data,
    get_state,
    get_lock,
    ensure_header_type,
    prep_hdr,
};
