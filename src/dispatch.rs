//! Dispatch & construction (C5): resolving a persistent offset into a
//! descriptor, and rebuilding a descriptor's derived fields.

use crate::block::{BlockType, MemoryBlock};
use crate::error::corrupt;
use crate::heap::Heap;
use crate::huge::HUGE_OPS;
use crate::layout::{ChunkType, HeaderType, CHUNKSIZE, RUN_METASIZE, ZONE_MAX_SIZE};
use crate::run::RUN_OPS;

/// Detect block kind from a chunk's persistent type (§4.5 step 6).
fn chunk_type_to_block_kind(t: ChunkType) -> BlockType {
    match t {
        ChunkType::Run | ChunkType::RunData => BlockType::Run,
        ChunkType::Free | ChunkType::Used | ChunkType::Footer => BlockType::Huge,
    }
}

fn ops_for(kind: BlockType) -> &'static crate::block::MemoryBlockOps {
    match kind {
        BlockType::Huge => &HUGE_OPS,
        BlockType::Run => &RUN_OPS,
    }
}

/// Resolve a persistent offset into a descriptor. `want_size` controls
/// whether `size_idx` is computed (it otherwise stays zero).
///
/// Any assertion failure here indicates on-media metadata corruption
/// and is fatal — see [`crate::error::corrupt`].
pub fn from_offset_opt(heap: &dyn Heap, off: u64, want_size: bool) -> MemoryBlock {
    let mut r = off
        .checked_sub(heap.zone0_offset())
        .unwrap_or_else(|| corrupt("offset precedes zone0"));

    let zone_id = (r / ZONE_MAX_SIZE as u64) as u32;
    r -= zone_id as u64 * ZONE_MAX_SIZE as u64 + heap.chunk_data_offset();

    // Step 3: the *initial* chunk_id, computed before any RUN_DATA
    // correction — order matters, this is the id the first header
    // read uses.
    let mut chunk_id = (r / CHUNKSIZE as u64) as u32;
    let mut hdr = unsafe { *heap.chunk_hdr_ptr(zone_id, chunk_id) };
    let mut chunk_type = hdr
        .detect_type()
        .unwrap_or_else(|| corrupt(format!("unknown chunk type {}", hdr.chunk_type)));

    if chunk_type == ChunkType::RunData {
        chunk_id -= hdr.size_idx;
        hdr = unsafe { *heap.chunk_hdr_ptr(zone_id, chunk_id) };
        chunk_type = hdr
            .detect_type()
            .unwrap_or_else(|| corrupt(format!("unknown chunk type {}", hdr.chunk_type)));
    }

    // Step 4: subtract using the corrected chunk_id.
    r -= CHUNKSIZE as u64 * chunk_id as u64;

    let header_type = HeaderType::from_flags(hdr.flags);
    r -= header_type.header_size() as u64;

    let block_kind_from_offset = if r == 0 { BlockType::Huge } else { BlockType::Run };
    let block_kind_from_type = chunk_type_to_block_kind(chunk_type);
    if block_kind_from_offset != block_kind_from_type {
        corrupt(format!(
            "block-kind disagreement: offset decode says {block_kind_from_offset:?}, chunk type says {block_kind_from_type:?}"
        ));
    }
    let block_type = block_kind_from_type;
    let m_ops = ops_for(block_type);

    let mut block_off: u32 = 0;

    if block_type == BlockType::Run {
        let run_hdr_ptr = heap.chunk_data_ptr(zone_id, chunk_id) as *const crate::run::RunHeader;
        let run = unsafe { *run_hdr_ptr };
        let run_data_addr = run_hdr_ptr as usize + RUN_METASIZE;
        let mut consumed = RUN_METASIZE as u64;
        if hdr.flags & crate::layout::chunk_flags::ALIGNED != 0 {
            consumed +=
                crate::run::alignment_padding(run_data_addr, run.alignment, header_type.header_size()) as u64;
        }
        r -= consumed;

        let unit_size = run.block_size;
        if unit_size == 0 {
            corrupt("run block_size is zero");
        }
        block_off = (r / unit_size) as u32;
        r -= block_off as u64 * unit_size;
    }

    if r != 0 {
        corrupt(format!("residual offset {r} after full decomposition"));
    }

    let size_idx = if want_size {
        let unit_size = match block_type {
            BlockType::Huge => CHUNKSIZE as u64,
            BlockType::Run => unsafe {
                (*(heap.chunk_data_ptr(zone_id, chunk_id) as *const crate::run::RunHeader)).block_size
            },
        };
        let probe = MemoryBlock {
            heap: heap as *const dyn Heap,
            zone_id,
            chunk_id,
            block_off,
            size_idx: 0,
            header_type,
            block_type,
            m_ops,
        };
        let header_size = probe.get_real_size();
        header_size.div_ceil(unit_size) as u32
    } else {
        0
    };

    MemoryBlock {
        heap: heap as *const dyn Heap,
        zone_id,
        chunk_id,
        block_off,
        size_idx,
        header_type,
        block_type,
        m_ops,
    }
}

/// `from_offset(heap, off)` — shorthand for `from_offset_opt` with
/// `want_size = true`.
pub fn from_offset(heap: &dyn Heap, off: u64) -> MemoryBlock {
    from_offset_opt(heap, off, true)
}

/// For a descriptor with `zone_id`, `chunk_id`, `block_off`, `size_idx`
/// already populated, fill in `heap`, `header_type`, `block_type`, and
/// `m_ops` by reading the chunk header.
pub fn rebuild_state(
    heap: &dyn Heap,
    zone_id: u32,
    chunk_id: u32,
    block_off: u32,
    size_idx: u32,
) -> MemoryBlock {
    let hdr = unsafe { *heap.chunk_hdr_ptr(zone_id, chunk_id) };
    let chunk_type = hdr
        .detect_type()
        .unwrap_or_else(|| corrupt(format!("unknown chunk type {}", hdr.chunk_type)));
    let header_type = HeaderType::from_flags(hdr.flags);
    let block_type = chunk_type_to_block_kind(chunk_type);
    let m_ops = ops_for(block_type);

    MemoryBlock {
        heap: heap as *const dyn Heap,
        zone_id,
        chunk_id,
        block_off,
        size_idx,
        header_type,
        block_type,
        m_ops,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{PersistOps, RunMutexHandle};
    use crate::layout::{chunk_flags, ChunkHeader};
    use std::cell::UnsafeCell;

    struct NullPersist;
    impl PersistOps for NullPersist {
        unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, len: usize, _flags: u8) {
            std::ptr::copy_nonoverlapping(src, dst, len);
        }
        unsafe fn persist(&self, _addr: *const u8, _len: usize) {}
    }

    const CHUNK_DATA_OFFSET: u64 = 4096;
    const NUM_CHUNKS: usize = 16;

    struct TestHeap {
        p_ops: NullPersist,
        hdrs: UnsafeCell<[ChunkHeader; NUM_CHUNKS]>,
        data: UnsafeCell<Vec<u8>>,
    }

    impl Heap for TestHeap {
        fn p_ops(&self) -> &dyn PersistOps {
            &self.p_ops
        }
        fn zone0_offset(&self) -> u64 {
            0
        }
        fn chunk_data_offset(&self) -> u64 {
            CHUNK_DATA_OFFSET
        }
        fn chunk_hdr_ptr(&self, _zone_id: u32, chunk_id: u32) -> *mut ChunkHeader {
            unsafe { (self.hdrs.get() as *mut ChunkHeader).add(chunk_id as usize) }
        }
        fn chunk_data_ptr(&self, _zone_id: u32, chunk_id: u32) -> *mut u8 {
            unsafe { (self.data.get() as *mut u8).add(chunk_id as usize * CHUNKSIZE) }
        }
        fn run_lock(&self, _chunk_id: u32) -> RunMutexHandle {
            RunMutexHandle::new(std::sync::Arc::new(parking_lot::Mutex::new(())))
        }
    }

    fn new_heap() -> TestHeap {
        TestHeap {
            p_ops: NullPersist,
            hdrs: UnsafeCell::new([ChunkHeader::new(0, 0, 0); NUM_CHUNKS]),
            data: UnsafeCell::new(vec![0u8; CHUNKSIZE * NUM_CHUNKS]),
        }
    }

    fn base_offset(chunk_id: u32) -> u64 {
        CHUNK_DATA_OFFSET + chunk_id as u64 * CHUNKSIZE as u64
    }

    #[test]
    fn huge_round_trip_legacy_header() {
        let heap = new_heap();
        unsafe {
            *heap.chunk_hdr_ptr(0, 3) = ChunkHeader::new(ChunkType::Used as u16, 0, 2);
        }
        let off = base_offset(3) + 64;
        let m = from_offset_opt(&heap, off, false);
        assert_eq!(m.zone_id, 0);
        assert_eq!(m.chunk_id, 3);
        assert_eq!(m.block_type, BlockType::Huge);
        assert_eq!(m.header_type, HeaderType::Legacy);
        assert_eq!(m.block_off, 0);
        assert_eq!(m.size_idx, 0);

        // The allocation header's own `size` field (not the chunk
        // header's `size_idx`) drives the `want_size` route; set it to
        // match the chunk's 2-chunk span so the two routes agree, per
        // the header-size-agreement property.
        unsafe {
            *(heap.chunk_data_ptr(0, 3) as *mut u64) = 2 * CHUNKSIZE as u64;
        }
        let m_sized = from_offset(&heap, off);
        assert_eq!(m_sized.size_idx, 2);
    }

    #[test]
    fn run_round_trip_with_compact_header() {
        let heap = new_heap();
        unsafe {
            *heap.chunk_hdr_ptr(0, 5) = ChunkHeader::new(
                ChunkType::Run as u16,
                chunk_flags::COMPACT_HEADER,
                0,
            );
            let run_ptr = heap.chunk_data_ptr(0, 5) as *mut crate::run::RunHeader;
            (*run_ptr).block_size = 128;
            (*run_ptr).alignment = 0;
        }
        let off = base_offset(5) + RUN_METASIZE as u64 + 16 + 128 * 7;
        let m = from_offset_opt(&heap, off, false);
        assert_eq!(m.block_off, 7);
        assert_eq!(m.block_type, BlockType::Run);
        assert_eq!(m.header_type, HeaderType::Compact);
    }

    #[test]
    #[should_panic]
    fn unknown_chunk_type_is_fatal() {
        let heap = new_heap();
        unsafe {
            // write a raw, out-of-range chunk_type
            *heap.chunk_hdr_ptr(0, 0) = ChunkHeader::new(9, 0, 0);
        }
        from_offset_opt(&heap, base_offset(0), false);
    }

    #[test]
    #[should_panic]
    fn residual_offset_is_fatal() {
        let heap = new_heap();
        unsafe {
            *heap.chunk_hdr_ptr(0, 0) = ChunkHeader::new(ChunkType::Used as u16, 0, 1);
        }
        // One byte past the legacy header's end for a huge chunk: the
        // leftover byte makes the decode disagree with the chunk's
        // actual (huge) type, which is itself a fatal corruption.
        from_offset_opt(&heap, base_offset(0) + 65, false);
    }

    #[test]
    fn rebuild_state_fills_derived_fields() {
        let heap = new_heap();
        unsafe {
            *heap.chunk_hdr_ptr(0, 2) =
                ChunkHeader::new(ChunkType::Used as u16, chunk_flags::HEADER_NONE, 1);
        }
        let m = rebuild_state(&heap, 0, 2, 0, 1);
        assert_eq!(m.block_type, BlockType::Huge);
        assert_eq!(m.header_type, HeaderType::None);
    }
}
