use std::{
    fmt,
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use thiserror::Error;

use crate::format::Resolution;

/// Required alignment of every physical frame base.
pub const DMA_ALIGN: usize = 256;

/// Page granularity used for staging allocations.
pub const PAGE_SIZE: usize = 4096;

/// Bytes in one metadata-mode record: a kind tag plus two addresses.
pub const META_RECORD_LEN: usize = 12;

/// Record kind tag for frames sourced from the camera.
pub const META_KIND_CAMERA_SOURCE: u32 = 0;

const MIB: usize = 1 << 20;
const RAW_TIERS: [usize; 4] = [2 * MIB, 4 * MIB, 8 * MIB, 16 * MIB];
const RAW_TIERS_LARGE: [usize; 2] = [8 * MIB, 16 * MIB];

/// Sensor widths from here up always get the largest raw tier.
const WIDE_SENSOR_WIDTH: u32 = 2592;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    #[error("physical base {phys:#010x} is not {DMA_ALIGN}-byte aligned")]
    Unaligned { phys: u32 },
    #[error("frame length {frame_len} would break physical alignment")]
    BadFrameLen { frame_len: usize },
    #[error("{pool} pool cannot carve {count} x {frame_len} bytes out of {heap_len}")]
    Carve {
        pool: PoolId,
        count: usize,
        frame_len: usize,
        heap_len: usize,
    },
    #[error("frame index {index} out of range, pool holds {count}")]
    BadIndex { index: usize, count: usize },
    #[error("frame {index} released twice")]
    DoubleRelease { index: usize },
    #[error("capture geometry {width}x{height} exceeds the largest raw tier")]
    CaptureTooLarge { width: u32, height: u32 },
}

/// Identity of the pool a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PoolId {
    Preview,
    Raw,
    JpegStaging,
    Scratch,
    Metadata,
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolId::Preview => "preview",
            PoolId::Raw => "raw",
            PoolId::JpegStaging => "jpeg-staging",
            PoolId::Scratch => "scratch",
            PoolId::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

/// The identity of one frame everywhere in the system.
///
/// Frames are referred to by pool and slot index, never by address; the
/// address math stays inside [`FramePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameHandle {
    pub pool: PoolId,
    pub index: usize,
}

/// Round up to the DMA alignment.
pub const fn align_256(n: usize) -> usize {
    (n + (DMA_ALIGN - 1)) & !(DMA_ALIGN - 1)
}

/// Round up to page granularity.
pub const fn align_page(n: usize) -> usize {
    (n + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

/// Bytes reserved per preview frame: 4:2:0 payload rounded up so every
/// frame base in the pool stays DMA-aligned.
pub const fn preview_frame_len(res: Resolution) -> usize {
    align_256(res.pixels() * 3 / 2)
}

/// Bytes reserved for the raw capture frame.
///
/// The hardware pipeline wants power-of-two-ish tiers rather than exact
/// sizes; wide sensors always get the top tier.
pub fn raw_frame_len(res: Resolution, large_raw: bool) -> Result<usize, HeapError> {
    if res.width.get() >= WIDE_SENSOR_WIDTH {
        return Ok(16 * MIB);
    }
    let need = res.pixels() * 2;
    let tiers: &[usize] = if large_raw { &RAW_TIERS_LARGE } else { &RAW_TIERS };
    tiers
        .iter()
        .copied()
        .find(|tier| *tier >= need)
        .ok_or(HeapError::CaptureTooLarge {
            width: res.width.get(),
            height: res.height.get(),
        })
}

/// Bytes reserved for encoder staging: the raw ceiling, page aligned.
pub fn jpeg_staging_len(res: Resolution, large_raw: bool) -> Result<usize, HeapError> {
    Ok(align_page(raw_frame_len(res, large_raw)?))
}

/// Bytes per scratch frame used while digital zoom or interpolation is
/// active at capture time.
pub fn scratch_frame_len(res: Resolution, zoom_level: u32) -> usize {
    let div = zoom_level as usize + 1;
    let w = res.width.get() as usize / div;
    let h = res.height.get() as usize / div;
    align_page(w * h * 2)
}

// Synthetic address windows handed out by `DmaHeap::alloc`. Regions are
// page-spaced so every base satisfies the DMA alignment.
const PHYS_WINDOW: u32 = 0x1000_0000;
const VIRT_WINDOW: u32 = 0x5000_0000;
static NEXT_REGION: AtomicU32 = AtomicU32::new(0);

/// One contiguous DMA-capable region: a physical and a virtual base plus a
/// length.
///
/// The heap only does address arithmetic; frame bytes live with the pool
/// slots so a fill and a read of different frames never contend.
///
/// # Example
/// ```rust
/// use argus_core::prelude::DmaHeap;
///
/// let heap = DmaHeap::map(4096, 0x2000_0000, 0x7000_0000).unwrap();
/// assert_eq!(heap.phys_base(), 0x2000_0000);
/// assert!(DmaHeap::map(4096, 0x2000_0010, 0x7000_0000).is_err());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DmaHeap {
    phys_base: u32,
    virt_base: u32,
    len: usize,
}

impl DmaHeap {
    /// Adopt an existing mapping. Fails unless the physical base is
    /// DMA-aligned.
    pub fn map(len: usize, phys_base: u32, virt_base: u32) -> Result<Self, HeapError> {
        if phys_base as usize % DMA_ALIGN != 0 {
            return Err(HeapError::Unaligned { phys: phys_base });
        }
        Ok(Self {
            phys_base,
            virt_base,
            len,
        })
    }

    /// Allocate a fresh region with synthetic, process-unique bases.
    pub fn alloc(len: usize) -> Result<Self, HeapError> {
        let span = align_page(len).max(PAGE_SIZE) as u32;
        let offset = NEXT_REGION.fetch_add(span, Ordering::Relaxed);
        Self::map(len, PHYS_WINDOW + offset, VIRT_WINDOW + offset)
    }

    pub fn phys_base(&self) -> u32 {
        self.phys_base
    }

    pub fn virt_base(&self) -> u32 {
        self.virt_base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A [`DmaHeap`] carved into `count` equal frames with exactly-once
/// claim/release accounting.
///
/// # Example
/// ```rust
/// use argus_core::prelude::*;
///
/// let res = Resolution::new(640, 480).unwrap();
/// let pool = FramePool::new(PoolId::Preview, 2, preview_frame_len(res)).unwrap();
/// let a = pool.claim().unwrap();
/// let b = pool.claim().unwrap();
/// assert!(pool.claim().is_none());
/// pool.release(a.index).unwrap();
/// pool.release(b.index).unwrap();
/// assert!(pool.release(b.index).is_err());
/// ```
pub struct FramePool {
    id: PoolId,
    heap: DmaHeap,
    frame_len: usize,
    slots: Vec<Mutex<Box<[u8]>>>,
    free: Mutex<Vec<usize>>,
}

impl FramePool {
    /// Allocate a pool backed by a fresh heap.
    pub fn new(id: PoolId, count: usize, frame_len: usize) -> Result<Self, HeapError> {
        let total = count
            .checked_mul(frame_len)
            .ok_or(HeapError::BadFrameLen { frame_len })?;
        let heap = DmaHeap::alloc(total)?;
        Self::from_heap(id, heap, count, frame_len)
    }

    /// Carve an existing heap. All-or-nothing: if the geometry does not
    /// fit, no pool is built.
    pub fn from_heap(
        id: PoolId,
        heap: DmaHeap,
        count: usize,
        frame_len: usize,
    ) -> Result<Self, HeapError> {
        if frame_len == 0 || frame_len % DMA_ALIGN != 0 {
            return Err(HeapError::BadFrameLen { frame_len });
        }
        if count == 0 || count * frame_len > heap.len() {
            return Err(HeapError::Carve {
                pool: id,
                count,
                frame_len,
                heap_len: heap.len(),
            });
        }
        let slots = (0..count)
            .map(|_| Mutex::new(vec![0u8; frame_len].into_boxed_slice()))
            .collect();
        Ok(Self {
            id,
            heap,
            frame_len,
            slots,
            // Reverse so `claim` hands out slot 0 first.
            free: Mutex::new((0..count).rev().collect()),
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn heap(&self) -> &DmaHeap {
        &self.heap
    }

    /// Physical address of one frame.
    pub fn frame_phys(&self, index: usize) -> Result<u32, HeapError> {
        self.check(index)?;
        Ok(self.heap.phys_base() + (index * self.frame_len) as u32)
    }

    /// Virtual address of one frame.
    pub fn frame_virt(&self, index: usize) -> Result<u32, HeapError> {
        self.check(index)?;
        Ok(self.heap.virt_base() + (index * self.frame_len) as u32)
    }

    /// Take one free frame, or `None` when the pool is exhausted. Never
    /// blocks.
    pub fn claim(&self) -> Option<FrameHandle> {
        let index = self.free.lock().unwrap().pop()?;
        Some(FrameHandle {
            pool: self.id,
            index,
        })
    }

    /// Drain the free list, lowest index first.
    pub fn claim_all(&self) -> Vec<FrameHandle> {
        let mut free = self.free.lock().unwrap();
        let mut taken: Vec<usize> = free.drain(..).collect();
        taken.sort_unstable();
        taken
            .into_iter()
            .map(|index| FrameHandle {
                pool: self.id,
                index,
            })
            .collect()
    }

    /// Return a frame to the free list. Double release is rejected.
    pub fn release(&self, index: usize) -> Result<(), HeapError> {
        self.check(index)?;
        let mut free = self.free.lock().unwrap();
        if free.contains(&index) {
            return Err(HeapError::DoubleRelease { index });
        }
        free.push(index);
        Ok(())
    }

    /// Reset every frame to free. Idempotent.
    pub fn free_all(&self) {
        let mut free = self.free.lock().unwrap();
        free.clear();
        free.extend((0..self.slots.len()).rev());
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.lock().unwrap().len()
    }

    /// Write a frame in place. Each slot has its own lock, so filling one
    /// frame never blocks a reader of another.
    pub fn fill_frame(&self, index: usize, f: impl FnOnce(&mut [u8])) -> Result<(), HeapError> {
        self.check(index)?;
        let mut slot = self.slots[index].lock().unwrap();
        f(&mut slot);
        Ok(())
    }

    /// Read a frame in place.
    pub fn read_frame<R>(&self, index: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R, HeapError> {
        self.check(index)?;
        let slot = self.slots[index].lock().unwrap();
        Ok(f(&slot))
    }

    /// Copy `src` into the frame starting at `offset`, truncating at the
    /// frame end. Returns the number of bytes actually written.
    pub fn write_at(&self, index: usize, offset: usize, src: &[u8]) -> Result<usize, HeapError> {
        self.check(index)?;
        let mut slot = self.slots[index].lock().unwrap();
        if offset >= slot.len() {
            return Ok(0);
        }
        let n = src.len().min(slot.len() - offset);
        slot[offset..offset + n].copy_from_slice(&src[..n]);
        Ok(n)
    }

    /// Copy out the first `len` bytes of a frame (clamped to the frame
    /// length).
    pub fn copy_frame(&self, index: usize, len: usize) -> Result<Vec<u8>, HeapError> {
        self.check(index)?;
        let slot = self.slots[index].lock().unwrap();
        let n = len.min(slot.len());
        Ok(slot[..n].to_vec())
    }

    fn check(&self, index: usize) -> Result<(), HeapError> {
        if index >= self.slots.len() {
            return Err(HeapError::BadIndex {
                index,
                count: self.slots.len(),
            });
        }
        Ok(())
    }
}

/// Per-slot records handed to clients in metadata-buffer mode.
///
/// Each record is `{ kind, phys, virt }`, three little-endian `u32`s, so a
/// downstream encoder can reach the frame without a copy.
pub struct MetaPool {
    records: Mutex<Vec<u8>>,
    count: usize,
}

impl MetaPool {
    pub fn new(count: usize) -> Self {
        Self {
            records: Mutex::new(vec![0u8; count * META_RECORD_LEN]),
            count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn write_record(&self, index: usize, phys: u32, virt: u32) -> Result<(), HeapError> {
        if index >= self.count {
            return Err(HeapError::BadIndex {
                index,
                count: self.count,
            });
        }
        let mut records = self.records.lock().unwrap();
        let at = index * META_RECORD_LEN;
        records[at..at + 4].copy_from_slice(&META_KIND_CAMERA_SOURCE.to_le_bytes());
        records[at + 4..at + 8].copy_from_slice(&phys.to_le_bytes());
        records[at + 8..at + 12].copy_from_slice(&virt.to_le_bytes());
        Ok(())
    }

    pub fn record(&self, index: usize) -> Result<[u8; META_RECORD_LEN], HeapError> {
        if index >= self.count {
            return Err(HeapError::BadIndex {
                index,
                count: self.count,
            });
        }
        let records = self.records.lock().unwrap();
        let at = index * META_RECORD_LEN;
        let mut out = [0u8; META_RECORD_LEN];
        out.copy_from_slice(&records[at..at + META_RECORD_LEN]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(w: u32, h: u32) -> Resolution {
        Resolution::new(w, h).unwrap()
    }

    #[test]
    fn unaligned_phys_base_is_rejected() {
        assert!(matches!(
            DmaHeap::map(4096, 0x1000_0010, 0x5000_0000),
            Err(HeapError::Unaligned { phys: 0x1000_0010 })
        ));
        assert!(DmaHeap::map(4096, 0x1000_0000, 0x5000_0000).is_ok());
    }

    #[test]
    fn preview_frames_are_dma_aligned() {
        // 640x480 * 3/2 is already a multiple of 256.
        assert_eq!(preview_frame_len(res(640, 480)), 460_800);
        // 176x144 * 3/2 = 38016 rounds up.
        assert_eq!(preview_frame_len(res(176, 144)), 38_144);
    }

    #[test]
    fn raw_tiers_cover_the_size_table() {
        assert_eq!(raw_frame_len(res(640, 480), false), Ok(2 * MIB));
        assert_eq!(raw_frame_len(res(1280, 960), false), Ok(4 * MIB));
        assert_eq!(raw_frame_len(res(2048, 1536), false), Ok(8 * MIB));
        // Wide sensors always take the top tier.
        assert_eq!(raw_frame_len(res(2592, 1944), false), Ok(16 * MIB));
        assert_eq!(raw_frame_len(res(2592, 16), false), Ok(16 * MIB));
    }

    #[test]
    fn large_raw_variant_skips_the_small_tiers() {
        assert_eq!(raw_frame_len(res(640, 480), true), Ok(8 * MIB));
        assert_eq!(raw_frame_len(res(2048, 1536), true), Ok(8 * MIB));
        assert_eq!(raw_frame_len(res(2560, 1920), true), Ok(16 * MIB));
    }

    #[test]
    fn oversized_capture_is_an_error() {
        assert_eq!(
            raw_frame_len(res(2560, 4000), false),
            Err(HeapError::CaptureTooLarge {
                width: 2560,
                height: 4000
            })
        );
    }

    #[test]
    fn jpeg_staging_is_the_raw_ceiling_page_aligned() {
        assert_eq!(jpeg_staging_len(res(640, 480), false), Ok(2 * MIB));
        assert_eq!(jpeg_staging_len(res(2592, 1944), false), Ok(16 * MIB));
    }

    #[test]
    fn scratch_len_shrinks_with_zoom() {
        assert_eq!(scratch_frame_len(res(2048, 1536), 1), align_page(1024 * 768 * 2));
        assert_eq!(scratch_frame_len(res(2048, 1536), 3), align_page(512 * 384 * 2));
    }

    #[test]
    fn claim_release_accounting_is_exactly_once() {
        let pool = FramePool::new(PoolId::Preview, 3, 512).unwrap();
        let a = pool.claim().unwrap();
        assert_eq!(a.index, 0);
        let b = pool.claim().unwrap();
        assert_eq!(b.index, 1);
        assert_eq!(pool.in_use(), 2);

        pool.release(a.index).unwrap();
        assert_eq!(
            pool.release(a.index),
            Err(HeapError::DoubleRelease { index: 0 })
        );
        assert_eq!(pool.release(7), Err(HeapError::BadIndex { index: 7, count: 3 }));
    }

    #[test]
    fn claim_all_then_free_all_resets_the_pool() {
        let pool = FramePool::new(PoolId::Preview, 4, 256).unwrap();
        let all = pool.claim_all();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].index, 0);
        assert!(pool.claim().is_none());
        pool.free_all();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.claim().unwrap().index, 0);
    }

    #[test]
    fn carve_geometry_is_all_or_nothing() {
        let heap = DmaHeap::alloc(1024).unwrap();
        assert!(matches!(
            FramePool::from_heap(PoolId::Raw, heap, 8, 256),
            Err(HeapError::Carve { .. })
        ));
        let heap = DmaHeap::alloc(2048).unwrap();
        assert!(FramePool::from_heap(PoolId::Raw, heap, 8, 256).is_ok());
    }

    #[test]
    fn write_at_truncates_at_the_frame_end() {
        let pool = FramePool::new(PoolId::JpegStaging, 1, 256).unwrap();
        let data = vec![0xAB; 300];
        assert_eq!(pool.write_at(0, 0, &data), Ok(256));
        assert_eq!(pool.write_at(0, 200, &data), Ok(56));
        assert_eq!(pool.write_at(0, 256, &data), Ok(0));
        let copy = pool.copy_frame(0, 300).unwrap();
        assert_eq!(copy.len(), 256);
        assert!(copy.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn frame_addresses_step_by_frame_len() {
        let heap = DmaHeap::map(4 * 512, 0x2000_0000, 0x7000_0000).unwrap();
        let pool = FramePool::from_heap(PoolId::Preview, heap, 4, 512).unwrap();
        assert_eq!(pool.frame_phys(0), Ok(0x2000_0000));
        assert_eq!(pool.frame_phys(3), Ok(0x2000_0600));
        assert_eq!(pool.frame_virt(1), Ok(0x7000_0200));
    }

    #[test]
    fn meta_records_are_little_endian_triples() {
        let meta = MetaPool::new(4);
        meta.write_record(2, 0x1234_5678, 0x9ABC_DEF0).unwrap();
        let rec = meta.record(2).unwrap();
        assert_eq!(&rec[0..4], &0u32.to_le_bytes());
        assert_eq!(&rec[4..8], &0x1234_5678u32.to_le_bytes());
        assert_eq!(&rec[8..12], &0x9ABC_DEF0u32.to_le_bytes());
        assert!(meta.write_record(4, 0, 0).is_err());
    }
}
