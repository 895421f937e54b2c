//! The runtime memory-block descriptor and the generic operations
//! shared across block kinds (C4.4).

use crate::header;
use crate::heap::{Heap, OperationContext, RunMutexHandle};
use crate::layout::HeaderType;
use crate::vg;

/// Which concrete operation vector a descriptor is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Huge,
    Run,
}

/// The allocation state of a block, as reported by `get_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Allocated,
    Free,
    Unknown,
}

/// The direction of a `prep_hdr` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Allocated,
    Free,
}

/// The block-kind operation vector: huge-chunk or run-block behavior,
/// bound once at construction and reused as plain data thereafter.
///
/// A `&'static` function-pointer table rather than a trait object: the
/// dispatch key (block kind) is resolved once, from decoded persistent
/// bytes, and then carried alongside the raw addresses the functions
/// operate on — there's no dynamic object to own a vtable for.
pub struct MemoryBlockOps {
    pub block_size: fn(&MemoryBlock) -> u64,
    pub get_real_data: fn(&MemoryBlock) -> *mut u8,
    pub get_state: fn(&MemoryBlock) -> BlockState,
    pub get_lock: fn(&MemoryBlock) -> Option<RunMutexHandle>,
    pub ensure_header_type: fn(&MemoryBlock, HeaderType),
    pub prep_hdr: fn(&MemoryBlock, BlockOp, Option<&mut dyn OperationContext>),
}

/// A transient, value-typed handle identifying one allocation unit.
///
/// `heap` is a raw pointer rather than a borrow so this struct (and the
/// function-pointer tables that operate on it) stay free of a lifetime
/// parameter, matching "value-typed, cheaply copyable, carries no
/// ownership of persistent state". Constructing a descriptor requires
/// the originating heap to outlive it; descriptors are never retained
/// past the scope of the heap reference used to build them.
#[derive(Clone, Copy)]
pub struct MemoryBlock {
    pub heap: *const dyn Heap,
    pub zone_id: u32,
    pub chunk_id: u32,
    pub block_off: u32,
    /// 0 means "size is only recoverable from the header".
    pub size_idx: u32,
    pub header_type: HeaderType,
    pub block_type: BlockType,
    pub m_ops: &'static MemoryBlockOps,
}

impl MemoryBlock {
    /// Borrow the owning heap.
    ///
    /// # Safety
    /// Sound as long as the heap this descriptor was built from is
    /// still alive, which is the descriptor's standing invariant.
    pub fn heap(&self) -> &dyn Heap {
        unsafe { &*self.heap }
    }

    fn header_ops(&self) -> &'static header::HeaderOps {
        header::header_ops_for(self.header_type)
    }

    pub fn block_size(&self) -> u64 {
        (self.m_ops.block_size)(self)
    }

    pub fn get_real_data(&self) -> *mut u8 {
        (self.m_ops.get_real_data)(self)
    }

    pub fn get_state(&self) -> BlockState {
        (self.m_ops.get_state)(self)
    }

    pub fn get_lock(&self) -> Option<RunMutexHandle> {
        (self.m_ops.get_lock)(self)
    }

    pub fn ensure_header_type(&self, flavor: HeaderType) {
        (self.m_ops.ensure_header_type)(self, flavor)
    }

    pub fn prep_hdr(&self, op: BlockOp, ctx: Option<&mut dyn OperationContext>) {
        (self.m_ops.prep_hdr)(self, op, ctx)
    }

    /// `get_real_data(m) + header_size(flavor)`.
    pub fn get_user_data(&self) -> *mut u8 {
        unsafe { self.get_real_data().add(self.header_type.header_size()) }
    }

    /// If `size_idx != 0`, `block_size(m) * size_idx`; else the
    /// flavor's own `get_size`, for blocks resolved from an offset
    /// alone with `size_idx` left unknown.
    pub fn get_real_size(&self) -> u64 {
        if self.size_idx != 0 {
            self.block_size() * self.size_idx as u64
        } else {
            (self.header_ops().get_size)(self)
        }
    }

    pub fn get_user_size(&self) -> u64 {
        self.get_real_size() - self.header_type.header_size() as u64
    }

    pub fn get_extra(&self) -> u64 {
        (self.header_ops().get_extra)(self)
    }

    pub fn get_flags(&self) -> u16 {
        (self.header_ops().get_flags)(self)
    }

    /// Compute real size via the §4.4 rule and delegate to the
    /// flavor's `write`.
    pub fn write_header(&self, extra: u64, flags: u16) {
        let size = self.get_real_size();
        (self.header_ops().write)(self, size, extra, flags)
    }

    /// Mark user bytes and header as clean for instrumentation, then
    /// delegate to the flavor's `invalidate`.
    pub fn invalidate(&self) {
        vg::set_clean(self.get_user_data(), self.get_user_size() as usize);
        (self.header_ops().invalidate)(self)
    }

    pub fn reinit_header(&self) {
        (self.header_ops().reinit)(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{memcpy_flags, PersistOps};
    use crate::layout::ChunkHeader;

    struct NullPersist;
    impl PersistOps for NullPersist {
        unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, len: usize, _flags: u8) {
            std::ptr::copy_nonoverlapping(src, dst, len);
        }
        unsafe fn persist(&self, _addr: *const u8, _len: usize) {}
    }

    struct DummyHeap {
        p_ops: NullPersist,
        buf: std::cell::UnsafeCell<[u8; 256]>,
    }
    impl Heap for DummyHeap {
        fn p_ops(&self) -> &dyn PersistOps {
            &self.p_ops
        }
        fn zone0_offset(&self) -> u64 {
            0
        }
        fn chunk_data_offset(&self) -> u64 {
            0
        }
        fn chunk_hdr_ptr(&self, _zone_id: u32, _chunk_id: u32) -> *mut ChunkHeader {
            self.buf.get() as *mut ChunkHeader
        }
        fn chunk_data_ptr(&self, _zone_id: u32, _chunk_id: u32) -> *mut u8 {
            unsafe { (self.buf.get() as *mut u8).add(8) }
        }
        fn run_lock(&self, _chunk_id: u32) -> RunMutexHandle {
            RunMutexHandle::new(std::sync::Arc::new(parking_lot::Mutex::new(())))
        }
    }

    // A minimal ops table exercising the generic (C4.4) arithmetic
    // without pulling in huge.rs/run.rs.
    fn stub_block_size(_m: &MemoryBlock) -> u64 {
        64
    }
    fn stub_get_real_data(m: &MemoryBlock) -> *mut u8 {
        m.heap().chunk_data_ptr(m.zone_id, m.chunk_id)
    }
    fn stub_get_state(_m: &MemoryBlock) -> BlockState {
        BlockState::Allocated
    }
    fn stub_get_lock(_m: &MemoryBlock) -> Option<RunMutexHandle> {
        None
    }
    fn stub_ensure_header_type(_m: &MemoryBlock, _flavor: HeaderType) {}
    fn stub_prep_hdr(_m: &MemoryBlock, _op: BlockOp, _ctx: Option<&mut dyn OperationContext>) {}

    static STUB_OPS: MemoryBlockOps = MemoryBlockOps {
        block_size: stub_block_size,
        get_real_data: stub_get_real_data,
        get_state: stub_get_state,
        get_lock: stub_get_lock,
        ensure_header_type: stub_ensure_header_type,
        prep_hdr: stub_prep_hdr,
    };

    #[test]
    fn generic_arithmetic_uses_size_idx_when_present() {
        let heap = DummyHeap {
            p_ops: NullPersist,
            buf: std::cell::UnsafeCell::new([0u8; 256]),
        };
        let m = MemoryBlock {
            heap: &heap as *const dyn Heap,
            zone_id: 0,
            chunk_id: 0,
            block_off: 0,
            size_idx: 2,
            header_type: HeaderType::Compact,
            block_type: BlockType::Huge,
            m_ops: &STUB_OPS,
        };
        assert_eq!(m.get_real_size(), 128);
        assert_eq!(m.get_user_size(), 128 - 16);
        assert_eq!(m.get_user_data(), unsafe { m.get_real_data().add(16) });
        let _ = memcpy_flags::WC;
    }
}
