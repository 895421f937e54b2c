//! Reference, mmap-backed `Heap` implementation (C7).
//!
//! Not part of the abstract contract this crate consumes from its
//! owning heap — a real embedder supplies its own zone storage and
//! persistence primitives. This is shipped so [`crate::dispatch`],
//! [`crate::huge`] and [`crate::run`] have something concrete to run
//! against in this crate's own tests, and as a starting point for
//! embedders wiring up a real pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::heap::{EntryKind, Heap, OperationContext, PersistOps, RedoOp, RunMutexHandle};
use crate::layout::{ChunkHeader, CHUNKSIZE, ZONE_MAX_SIZE};

/// Fixed-size header at the start of each zone. Real pool metadata
/// (pool UUID, per-zone chunk count negotiated at pool-create time,
/// checksums) lives above this crate's concern; this carries just
/// enough for `HeapRegion` to validate a mapping it opens.
#[repr(C)]
#[derive(Clone, Copy)]
struct ZoneHeader {
    magic: u64,
    chunks: u32,
    _reserved: u32,
}

const ZONE_HEADER_SIZE: usize = std::mem::size_of::<ZoneHeader>();
const _: () = assert!(ZONE_HEADER_SIZE == 16);

const ZONE_MAGIC: u64 = 0x5a4f4e455f4d454d; // b"ZONE_MEM" read little-endian

/// Persistence primitives are implemented directly on `HeapRegion`
/// rather than a separate zero-sized type, because `persist` needs to
/// call back into the owning `MmapMut` to flush — a standalone type
/// would either duplicate a pointer to it (a self-referential hazard
/// across moves of `HeapRegion`) or be unable to flush anything.
impl PersistOps for HeapRegion {
    /// An ordinary copy — a regular mmap has no hardware
    /// write-combining or non-temporal store distinction to honor, so
    /// `flags` is accepted and ignored rather than faked.
    unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, len: usize, _flags: u8) {
        std::ptr::copy_nonoverlapping(src, dst, len);
    }

    /// Best-effort `msync` of the covered range via
    /// `MmapMut::flush_range`. Failures are logged, not propagated —
    /// this mirrors the persistent-layer's own fatal/assert split
    /// (§7): a `persist` that can't reach the OS is an environment
    /// problem the caller of this reference heap can't act on through
    /// the fire-and-forget `PersistOps::persist` signature.
    unsafe fn persist(&self, addr: *const u8, len: usize) {
        let base = self.mmap.as_ptr() as usize;
        let offset = (addr as usize).saturating_sub(base);
        if let Err(err) = self.mmap.flush_range(offset, len) {
            log::warn!("HeapRegion::persist: flush_range({offset}, {len}) failed: {err}");
        }
    }
}

/// A simple in-order redo-log context: entries are recorded, then
/// applied to the mapping in the order they were added on `commit`.
///
/// This is not a crash-safe redo log — a real one persists its entry
/// list before touching the target addresses, so a crash mid-commit
/// can be replayed. It preserves the one property this crate's own
/// operations rely on: entries added to the same context apply in the
/// order they were added, and a context that is dropped without
/// `commit` leaves persistent state untouched.
#[derive(Default)]
pub struct SimpleOperationContext {
    entries: Vec<(*mut u64, u64, RedoOp, EntryKind)>,
}

impl SimpleOperationContext {
    pub fn new() -> Self {
        SimpleOperationContext::default()
    }

    /// Apply every recorded entry, in order, then clear the log.
    ///
    /// # Safety
    /// Every address passed to `add_entry`/`add_typed_entry` must
    /// still be valid for an 8-byte read-modify-write.
    pub unsafe fn commit(&mut self) {
        for (addr, value, op, _kind) in self.entries.drain(..) {
            let cur = std::ptr::read(addr);
            let new = match op {
                RedoOp::Set => value,
                RedoOp::Or => cur | value,
                RedoOp::And => cur & value,
            };
            std::ptr::write(addr, new);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl OperationContext for SimpleOperationContext {
    unsafe fn add_typed_entry(&mut self, addr: *mut u64, value: u64, op: RedoOp, kind: EntryKind) {
        self.entries.push((addr, value, op, kind));
    }
}

/// A concrete, mmap-backed `Heap`: `num_zones` zones of `chunks_per_zone`
/// fixed-size chunks each, over a regular file.
///
/// Zones are spaced `ZONE_MAX_SIZE` apart in the mapping, matching the
/// stride [`crate::dispatch::from_offset_opt`] assumes when decoding an
/// offset's `zone_id`. The backing file therefore reserves
/// `num_zones * ZONE_MAX_SIZE` bytes; on a filesystem with sparse-file
/// support this costs disk space only for the pages actually touched; a
/// zone's header, chunk-header array, and chunk data together only have
/// to fit inside that stride, not fill it.
pub struct HeapRegion {
    mmap: MmapMut,
    path: PathBuf,
    chunks_per_zone: u32,
    run_locks: Vec<Arc<Mutex<()>>>,
}

impl HeapRegion {
    fn zone_payload_size(chunks_per_zone: u32) -> usize {
        ZONE_HEADER_SIZE
            + chunks_per_zone as usize * std::mem::size_of::<ChunkHeader>()
            + chunks_per_zone as usize * CHUNKSIZE
    }

    fn chunk_data_offset_for(chunks_per_zone: u32) -> u64 {
        (ZONE_HEADER_SIZE + chunks_per_zone as usize * std::mem::size_of::<ChunkHeader>()) as u64
    }

    /// Create a new region, zero-initializing every zone (all chunk
    /// headers start `FREE`, `type = 0`).
    pub fn create<P: AsRef<Path>>(path: P, num_zones: u32, chunks_per_zone: u32) -> io::Result<Self> {
        assert!(num_zones > 0, "a heap needs at least one zone");
        let payload = Self::zone_payload_size(chunks_per_zone);
        assert!(
            payload <= ZONE_MAX_SIZE,
            "zone payload ({payload} bytes) exceeds the ZONE_MAX_SIZE stride"
        );

        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let total_size = num_zones as u64 * ZONE_MAX_SIZE as u64;
        file.set_len(total_size)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        for zone_id in 0..num_zones {
            let base = zone_id as usize * ZONE_MAX_SIZE;
            mmap[base..base + payload].fill(0);
            let zone_hdr = unsafe { &mut *(mmap.as_mut_ptr().add(base) as *mut ZoneHeader) };
            zone_hdr.magic = ZONE_MAGIC;
            zone_hdr.chunks = chunks_per_zone;
        }
        mmap.flush()?;

        let run_locks = (0..chunks_per_zone).map(|_| Arc::new(Mutex::new(()))).collect();

        Ok(HeapRegion {
            mmap,
            path,
            chunks_per_zone,
            run_locks,
        })
    }

    /// Open an existing region, validating every zone's magic.
    pub fn open<P: AsRef<Path>>(path: P, chunks_per_zone: u32) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let len = mmap.len() as u64;
        if len == 0 || len % ZONE_MAX_SIZE as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region size is not a multiple of ZONE_MAX_SIZE",
            ));
        }
        let num_zones = len / ZONE_MAX_SIZE as u64;
        for zone_id in 0..num_zones {
            let base = zone_id as usize * ZONE_MAX_SIZE;
            let zone_hdr = unsafe { &*(mmap.as_ptr().add(base) as *const ZoneHeader) };
            if zone_hdr.magic != ZONE_MAGIC {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad zone magic"));
            }
        }

        let run_locks = (0..chunks_per_zone).map(|_| Arc::new(Mutex::new(()))).collect();

        Ok(HeapRegion {
            mmap,
            path,
            chunks_per_zone,
            run_locks,
        })
    }

    /// Create if the backing file doesn't exist yet, otherwise open it.
    pub fn create_or_open<P: AsRef<Path>>(path: P, num_zones: u32, chunks_per_zone: u32) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            Self::open(&path, chunks_per_zone)
        } else {
            Self::create(&path, num_zones, chunks_per_zone)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunks_per_zone(&self) -> u32 {
        self.chunks_per_zone
    }

    fn zone_base(&self, zone_id: u32) -> *mut u8 {
        unsafe { (self.mmap.as_ptr() as *mut u8).add(zone_id as usize * ZONE_MAX_SIZE) }
    }
}

impl Heap for HeapRegion {
    fn p_ops(&self) -> &dyn PersistOps {
        self
    }

    fn zone0_offset(&self) -> u64 {
        0
    }

    fn chunk_data_offset(&self) -> u64 {
        Self::chunk_data_offset_for(self.chunks_per_zone)
    }

    fn chunk_hdr_ptr(&self, zone_id: u32, chunk_id: u32) -> *mut ChunkHeader {
        debug_assert!(chunk_id < self.chunks_per_zone);
        unsafe { (self.zone_base(zone_id).add(ZONE_HEADER_SIZE) as *mut ChunkHeader).add(chunk_id as usize) }
    }

    fn chunk_data_ptr(&self, zone_id: u32, chunk_id: u32) -> *mut u8 {
        debug_assert!(chunk_id < self.chunks_per_zone);
        unsafe {
            self.zone_base(zone_id)
                .add(self.chunk_data_offset() as usize)
                .add(chunk_id as usize * CHUNKSIZE)
        }
    }

    fn run_lock(&self, chunk_id: u32) -> RunMutexHandle {
        RunMutexHandle::new(self.run_locks[chunk_id as usize].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ChunkType;

    #[test]
    fn create_zero_initializes_all_chunk_headers_to_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.region");
        let heap = HeapRegion::create(&path, 1, 8).unwrap();
        for chunk_id in 0..8 {
            let hdr = unsafe { *heap.chunk_hdr_ptr(0, chunk_id) };
            assert_eq!(hdr.detect_type(), Some(ChunkType::Free));
            assert_eq!(hdr.size_idx, 0);
        }
    }

    #[test]
    fn create_or_open_reopens_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.region");
        {
            let heap = HeapRegion::create_or_open(&path, 1, 8).unwrap();
            unsafe {
                *heap.chunk_hdr_ptr(0, 3) = ChunkHeader::new(ChunkType::Used as u16, 0, 1);
            }
        }
        let heap = HeapRegion::create_or_open(&path, 1, 8).unwrap();
        let hdr = unsafe { *heap.chunk_hdr_ptr(0, 3) };
        assert_eq!(hdr.detect_type(), Some(ChunkType::Used));
    }

    #[test]
    fn open_rejects_file_with_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.region");
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(ZONE_MAX_SIZE as u64).unwrap();
        assert!(HeapRegion::open(&path, 8).is_err());
    }

    #[test]
    fn run_lock_returns_a_distinct_mutex_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.region");
        let heap = HeapRegion::create(&path, 1, 4).unwrap();
        // If chunk 1 and chunk 2 shared a mutex, holding both guards at
        // once would deadlock; reaching this point at all proves
        // they're backed by distinct `Arc<Mutex<()>>`s.
        let lock_one = heap.run_lock(1);
        let lock_two = heap.run_lock(2);
        let guard_one = lock_one.lock();
        let guard_two = lock_two.lock();
        drop((guard_one, guard_two));
    }
}
