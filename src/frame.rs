//! Frame buffers and the session frame pool.
//!
//! The pool is a fixed ring of reference-counted buffers. A frame is lent to
//! at most one reassembly slot at a time and to the application between the
//! frame-ready notification and the drop of its [`FrameLease`]. The
//! at-most-one-concurrent-writer property is structural: every payload range
//! is claimed exactly once through the slot bitmap before anything writes
//! into it, so the buffer needs no lock on the hot path.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;

/// I/O-virtual address placeholder for frames that are not DMA-mapped.
pub const BAD_IOVA: u64 = u64::MAX;

/// Shared writable byte buffer backing an application-provided frame.
pub struct ExtBytes {
    cell: UnsafeCell<Box<[u8]>>,
}

// Writes land in ranges claimed once via the slot bitmap; readers only look
// after frame-ready. Same discipline as the pool-owned buffers.
unsafe impl Send for ExtBytes {}
unsafe impl Sync for ExtBytes {}

impl ExtBytes {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self { cell: UnsafeCell::new(vec![0u8; len].into_boxed_slice()) })
    }

    pub fn len(&self) -> usize {
        unsafe { (&*self.cell.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw view of the buffer. Ranges still being written by the receive
    /// path are unstable; completed frames are safe to read.
    pub fn bytes(&self) -> &[u8] {
        unsafe { &*self.cell.get() }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        let buf = unsafe { &mut *self.cell.get() };
        buf[offset..offset + src.len()].copy_from_slice(src);
    }
}

/// Application-provided frame memory with its I/O mapping.
#[derive(Clone)]
pub struct ExtFrame {
    pub data: Arc<ExtBytes>,
    pub iova: u64,
    /// Opaque application cookie, echoed back in the frame meta.
    pub opaque: u64,
}

/// Pre-mapped payload region used by header-split receive: the NIC writes
/// packet payloads straight into this buffer.
pub struct PayloadRegion {
    cell: UnsafeCell<Box<[u8]>>,
    iova: u64,
}

unsafe impl Send for PayloadRegion {}
unsafe impl Sync for PayloadRegion {}

impl PayloadRegion {
    pub fn new(len: usize, iova: u64) -> Arc<Self> {
        Arc::new(Self { cell: UnsafeCell::new(vec![0u8; len].into_boxed_slice()), iova })
    }

    pub fn len(&self) -> usize {
        unsafe { (&*self.cell.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { &*self.cell.get() }
    }

    /// Write into the region; used by queue backends standing in for the
    /// NIC and by the software copy fallback.
    pub fn write(&self, offset: usize, src: &[u8]) {
        let buf = unsafe { &mut *self.cell.get() };
        buf[offset..offset + src.len()].copy_from_slice(src);
    }
}

/// Late binding for frames whose memory is resolved at slot-assignment time.
pub enum SlotBinding {
    /// Dynamic external frame from `query_ext_frame`.
    Ext(ExtFrame),
    /// Header-split region slice starting at `base`.
    Region(Arc<PayloadRegion>, usize),
}

enum Storage {
    /// Pool-owned memory.
    Owned(UnsafeCell<Box<[u8]>>),
    /// Application memory fixed at pool construction.
    Ext(ExtFrame),
    /// Bound and unbound per frame lifetime (dynamic ext, header split).
    Slotted(RwLock<Option<SlotBinding>>),
}

/// One entry of a frame's physical page table.
#[derive(Debug, Clone, Copy)]
pub struct PageSeg {
    /// Byte offset of the page within the frame.
    pub off: usize,
    pub iova: u64,
    pub len: usize,
}

/// A single receive frame buffer.
pub struct FrameBuffer {
    idx: usize,
    size: usize,
    refcnt: AtomicU32,
    storage: Storage,
    iova: u64,
    page_table: Vec<PageSeg>,
    user_meta: UnsafeCell<Box<[u8]>>,
    user_meta_len: AtomicUsize,
}

unsafe impl Send for FrameBuffer {}
unsafe impl Sync for FrameBuffer {}

impl FrameBuffer {
    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Copy payload into the frame. The destination range must have been
    /// claimed through the slot bitmap first.
    pub fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.size, "payload past frame end");
        match &self.storage {
            Storage::Owned(cell) => {
                let buf = unsafe { &mut **(cell.get()) };
                buf[offset..offset + src.len()].copy_from_slice(src);
            }
            Storage::Ext(ext) => ext.data.write(offset, src),
            Storage::Slotted(binding) => match &*binding.read() {
                Some(SlotBinding::Ext(ext)) => ext.data.write(offset, src),
                Some(SlotBinding::Region(region, base)) => region.write(base + offset, src),
                None => {}
            },
        }
    }

    /// Raw view of the frame contents. Stable once the frame is closed.
    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(cell) => unsafe { &(**cell.get())[..self.size] },
            Storage::Ext(ext) => &ext.data.bytes()[..self.size],
            Storage::Slotted(binding) => match &*binding.read() {
                // The binding keeps the Arc alive for the frame's lifetime;
                // the view is only handed out while the lease is held.
                Some(SlotBinding::Ext(ext)) => unsafe {
                    let data = ext.data.bytes();
                    std::slice::from_raw_parts(data.as_ptr(), self.size.min(data.len()))
                },
                Some(SlotBinding::Region(region, base)) => unsafe {
                    let tail = &region.bytes()[*base..];
                    std::slice::from_raw_parts(tail.as_ptr(), self.size.min(tail.len()))
                },
                None => &[],
            },
        }
    }

    /// I/O address of a byte offset, honoring the page table when present.
    pub fn offset_iova(&self, offset: usize) -> u64 {
        if let Storage::Slotted(binding) = &self.storage {
            return match &*binding.read() {
                Some(SlotBinding::Ext(ext)) => ext.iova.wrapping_add(offset as u64),
                Some(SlotBinding::Region(region, base)) => {
                    region.iova() + (*base + offset) as u64
                }
                None => BAD_IOVA,
            };
        }
        if self.page_table.is_empty() {
            return self.iova.wrapping_add(offset as u64);
        }
        for page in &self.page_table {
            if offset >= page.off && offset < page.off + page.len {
                return page.iova + (offset - page.off) as u64;
            }
        }
        BAD_IOVA
    }

    /// True when a DMA of `len` bytes at `offset` would span two pages with
    /// non-contiguous I/O addresses.
    pub fn range_crosses_page(&self, offset: usize, len: usize) -> bool {
        if self.page_table.is_empty() || len == 0 {
            return false;
        }
        let first = self.offset_iova(offset);
        let last = self.offset_iova(offset + len - 1);
        last.wrapping_sub(first) != (len - 1) as u64
    }

    pub fn bind(&self, binding: SlotBinding) {
        if let Storage::Slotted(slot) = &self.storage {
            *slot.write() = Some(binding);
        }
    }

    pub fn unbind(&self) {
        if let Storage::Slotted(slot) = &self.storage {
            *slot.write() = None;
        }
    }

    /// Base offset into the header-split region, when bound to one.
    pub fn region_base(&self) -> Option<usize> {
        if let Storage::Slotted(slot) = &self.storage {
            if let Some(SlotBinding::Region(_, base)) = &*slot.read() {
                return Some(*base);
            }
        }
        None
    }

    /// Opaque cookie from a dynamic external frame binding.
    pub fn opaque(&self) -> u64 {
        match &self.storage {
            Storage::Ext(ext) => ext.opaque,
            Storage::Slotted(slot) => match &*slot.read() {
                Some(SlotBinding::Ext(ext)) => ext.opaque,
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Store the user-meta side channel payload. Fails when it does not fit.
    pub fn set_user_meta(&self, data: &[u8]) -> bool {
        let buf = unsafe { &mut **(self.user_meta.get()) };
        if data.len() > buf.len() {
            return false;
        }
        buf[..data.len()].copy_from_slice(data);
        self.user_meta_len.store(data.len(), Ordering::Release);
        true
    }

    pub fn clear_user_meta(&self) {
        self.user_meta_len.store(0, Ordering::Release);
    }

    pub fn user_meta(&self) -> &[u8] {
        let len = self.user_meta_len.load(Ordering::Acquire);
        let buf = unsafe { &**(self.user_meta.get()) };
        &buf[..len]
    }
}

/// How pool frames get their memory.
pub enum PoolKind {
    /// Pool allocates. `page_size` builds a per-frame page table for
    /// PA-IOVA DMA setups.
    Owned { page_size: Option<usize> },
    /// Application supplies one buffer per frame up front.
    Ext(Vec<ExtFrame>),
    /// Memory is bound per frame lifetime via `query_ext_frame`.
    Dynamic,
    /// Header-split: payload lives in the pre-mapped region.
    Region,
}

pub struct PoolConfig {
    pub count: usize,
    pub frame_size: usize,
    pub user_meta_size: usize,
    pub kind: PoolKind,
}

/// Fixed ring of frame buffers with reference counts.
pub struct FramePool {
    frames: Vec<Arc<FrameBuffer>>,
    frame_size: usize,
}

// Synthetic I/O base for pool-owned frames. Page-table entries get a gap
// between pages so a PA-IOVA boundary is actually discontiguous.
const OWNED_IOVA_BASE_SHIFT: u32 = 40;
const PAGE_IOVA_GAP: u64 = 1 << 20;

impl FramePool {
    pub fn new(cfg: PoolConfig) -> Result<Self, Error> {
        if cfg.count == 0 {
            return Err(Error::FramePool("zero frame count"));
        }
        let mut frames = Vec::with_capacity(cfg.count);
        let mut ext = match &cfg.kind {
            PoolKind::Ext(list) => {
                if list.len() < cfg.count {
                    return Err(Error::FramePool("not enough external frames"));
                }
                list.clone().into_iter()
            }
            _ => Vec::new().into_iter(),
        };
        for idx in 0..cfg.count {
            let (storage, iova, page_table) = match &cfg.kind {
                PoolKind::Owned { page_size } => {
                    let base = ((idx as u64) + 1) << OWNED_IOVA_BASE_SHIFT;
                    let table = match page_size {
                        Some(psz) if *psz > 0 => build_page_table(cfg.frame_size, *psz, base),
                        _ => Vec::new(),
                    };
                    (
                        Storage::Owned(UnsafeCell::new(
                            vec![0u8; cfg.frame_size].into_boxed_slice(),
                        )),
                        base,
                        table,
                    )
                }
                PoolKind::Ext(_) => {
                    let f = ext.next().expect("checked above");
                    if f.data.len() < cfg.frame_size {
                        return Err(Error::FramePool("external frame too small"));
                    }
                    if f.iova == 0 || f.iova == BAD_IOVA {
                        return Err(Error::FramePool("external frame not iova mapped"));
                    }
                    let iova = f.iova;
                    (Storage::Ext(f), iova, Vec::new())
                }
                PoolKind::Dynamic | PoolKind::Region => {
                    (Storage::Slotted(RwLock::new(None)), 0, Vec::new())
                }
            };
            frames.push(Arc::new(FrameBuffer {
                idx,
                size: cfg.frame_size,
                refcnt: AtomicU32::new(0),
                storage,
                iova,
                page_table,
                user_meta: UnsafeCell::new(vec![0u8; cfg.user_meta_size].into_boxed_slice()),
                user_meta_len: AtomicUsize::new(0),
            }));
        }
        Ok(Self { frames, frame_size: cfg.frame_size })
    }

    /// First free frame, refcount taken atomically.
    pub fn acquire(&self) -> Option<Arc<FrameBuffer>> {
        for f in &self.frames {
            if f.refcnt.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                return Some(f.clone());
            }
        }
        None
    }

    /// Return a reference. The frame goes back to the pool when the count
    /// reaches zero; a still-holding application keeps it out.
    pub fn put(&self, frame: &FrameBuffer) {
        frame.refcnt.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frame(&self, idx: usize) -> Option<&Arc<FrameBuffer>> {
        self.frames.get(idx)
    }

    /// Take an extra reference for the application lease.
    pub fn lease(self: &Arc<Self>, frame: Arc<FrameBuffer>) -> FrameLease {
        frame.refcnt.fetch_add(1, Ordering::AcqRel);
        FrameLease { pool: self.clone(), frame }
    }
}

fn build_page_table(frame_size: usize, page_size: usize, base: u64) -> Vec<PageSeg> {
    let mut table = Vec::new();
    let mut off = 0usize;
    let mut i = 0u64;
    while off < frame_size {
        let len = page_size.min(frame_size - off);
        table.push(PageSeg {
            off,
            iova: base + i * (page_size as u64 + PAGE_IOVA_GAP),
            len,
        });
        off += len;
        i += 1;
    }
    table
}

/// Application hold on a completed frame. Dropping the lease releases the
/// frame back toward the pool.
pub struct FrameLease {
    pool: Arc<FramePool>,
    frame: Arc<FrameBuffer>,
}

impl FrameLease {
    pub fn bytes(&self) -> &[u8] {
        self.frame.bytes()
    }

    pub fn user_meta(&self) -> &[u8] {
        self.frame.user_meta()
    }

    pub fn frame(&self) -> &FrameBuffer {
        &self.frame
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.pool.put(&self.frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned_pool(count: usize, size: usize) -> FramePool {
        FramePool::new(PoolConfig {
            count,
            frame_size: size,
            user_meta_size: 256,
            kind: PoolKind::Owned { page_size: None },
        })
        .unwrap()
    }

    #[test]
    fn acquire_release_cycle() {
        let pool = owned_pool(2, 64);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.index(), b.index());
        assert!(pool.acquire().is_none());
        pool.put(&a);
        let c = pool.acquire().unwrap();
        assert_eq!(c.index(), a.index());
    }

    #[test]
    fn lease_keeps_frame_out_of_pool() {
        let pool = Arc::new(owned_pool(1, 16));
        let f = pool.acquire().unwrap();
        let lease = pool.lease(f.clone());
        // Slot hands its reference back, application still holds.
        pool.put(&f);
        assert!(pool.acquire().is_none());
        drop(lease);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn write_and_read_back() {
        let pool = owned_pool(1, 32);
        let f = pool.acquire().unwrap();
        f.write(4, &[1, 2, 3, 4]);
        assert_eq!(&f.bytes()[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn user_meta_bounds() {
        let pool = owned_pool(1, 16);
        let f = pool.acquire().unwrap();
        assert!(f.set_user_meta(&[9u8; 200]));
        assert_eq!(f.user_meta().len(), 200);
        assert!(!f.set_user_meta(&[0u8; 400]));
        f.clear_user_meta();
        assert!(f.user_meta().is_empty());
    }

    #[test]
    fn page_table_crossing() {
        let pool = FramePool::new(PoolConfig {
            count: 1,
            frame_size: 4096,
            user_meta_size: 0,
            kind: PoolKind::Owned { page_size: Some(1024) },
        })
        .unwrap();
        let f = pool.acquire().unwrap();
        assert!(!f.range_crosses_page(0, 1024));
        assert!(f.range_crosses_page(1000, 100));
        assert!(!f.range_crosses_page(1024, 512));
        // iova within a page is contiguous
        assert_eq!(f.offset_iova(10) + 5, f.offset_iova(15));
        // and jumps across the boundary
        assert_ne!(f.offset_iova(1023) + 1, f.offset_iova(1024));
    }

    #[test]
    fn ext_pool_validation() {
        let good = ExtFrame { data: ExtBytes::new(64), iova: 0x1000, opaque: 7 };
        let pool = FramePool::new(PoolConfig {
            count: 1,
            frame_size: 64,
            user_meta_size: 0,
            kind: PoolKind::Ext(vec![good]),
        })
        .unwrap();
        let f = pool.acquire().unwrap();
        assert_eq!(f.offset_iova(8), 0x1008);
        assert_eq!(f.opaque(), 7);

        let unmapped = ExtFrame { data: ExtBytes::new(64), iova: 0, opaque: 0 };
        assert!(FramePool::new(PoolConfig {
            count: 1,
            frame_size: 64,
            user_meta_size: 0,
            kind: PoolKind::Ext(vec![unmapped]),
        })
        .is_err());
    }

    #[test]
    fn dynamic_binding() {
        let pool = FramePool::new(PoolConfig {
            count: 1,
            frame_size: 32,
            user_meta_size: 0,
            kind: PoolKind::Dynamic,
        })
        .unwrap();
        let f = pool.acquire().unwrap();
        assert_eq!(f.offset_iova(0), BAD_IOVA);
        f.bind(SlotBinding::Ext(ExtFrame { data: ExtBytes::new(32), iova: 0x2000, opaque: 3 }));
        f.write(0, &[5; 8]);
        assert_eq!(&f.bytes()[..8], &[5; 8]);
        assert_eq!(f.offset_iova(4), 0x2004);
        assert_eq!(f.opaque(), 3);
        f.unbind();
    }
}
