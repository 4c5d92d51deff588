//! Per-in-flight-frame reassembly state.
//!
//! A session owns a small fixed set of slots selected by RTP timestamp. The
//! packet bitmap is atomic because the optional packet co-thread and the
//! tasklet's ring-full fallback path both mark bits; everything structural
//! (timestamp, sequence base, the frame binding) lives behind the control
//! word and is written only by the slot-owning thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::frame::FrameBuffer;

/// Slots allocated per session. How many are active depends on the mode:
/// 1 by default, 2 with RTCP, all of them with the packet co-thread.
pub const SLOT_COUNT: usize = 4;

/// Slices tracked per slot in slice mode.
pub const SLICE_NUM: usize = 8;

/// Atomic packet-presence bitmap indexed by `seq - seq_base`.
pub struct Bitmap {
    words: Box<[AtomicU64]>,
    bits: usize,
}

impl Bitmap {
    pub fn new(bytes: usize) -> Self {
        let bits = bytes * 8;
        let words = (bits + 63) / 64;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bits
    }

    /// Set bit `idx`, returning its previous value. This is the duplicate
    /// gate: the caller that sees `false` owns the payload placement.
    pub fn test_and_set(&self, idx: usize) -> bool {
        let word = idx / 64;
        let mask = 1u64 << (idx % 64);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    pub fn test(&self, idx: usize) -> bool {
        let word = idx / 64;
        let mask = 1u64 << (idx % 64);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    pub fn clear_all(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Release);
        }
    }

    pub fn popcount(&self) -> u32 {
        self.words.iter().map(|w| w.load(Ordering::Acquire).count_ones()).sum()
    }
}

/// Outcome of feeding one contiguous byte range to the slice tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// Range absorbed; no new slice boundary crossed.
    Accepted,
    /// The main slice advanced past one or more slice boundaries.
    Ready(u32),
    /// No free slice entry for an out-of-order range.
    Fail,
}

#[derive(Debug, Clone, Copy, Default)]
struct SliceSpan {
    offset: u32,
    size: u32,
}

/// Tracks contiguous coverage of the current frame for slice-level
/// delivery. The main slice always begins at offset zero; out-of-order
/// ranges park in extra entries and merge back when the gap closes.
pub struct SliceTracker {
    slices: [SliceSpan; SLICE_NUM],
    extra_slices: u32,
    ready_slices: u32,
    /// Extra ranges merged into the main slice, for statistics.
    pub merged: u32,
}

impl SliceTracker {
    pub fn new() -> Self {
        Self {
            slices: [SliceSpan::default(); SLICE_NUM],
            extra_slices: 0,
            ready_slices: 0,
            merged: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn ready_slices(&self) -> u32 {
        self.ready_slices
    }

    pub fn add(&mut self, offset: u32, size: u32, slice_size: u32) -> SliceOutcome {
        let main_size = self.slices[0].size;
        if offset != main_size {
            // Out of order: park in a free entry or append to an existing one.
            for i in 1..SLICE_NUM {
                let s = &mut self.slices[i];
                if s.size == 0 {
                    s.offset = offset;
                    s.size = size;
                    self.extra_slices += 1;
                    return SliceOutcome::Accepted;
                }
                if offset == s.offset + s.size {
                    s.size += size;
                    return SliceOutcome::Accepted;
                }
            }
            return SliceOutcome::Fail;
        }

        self.slices[0].size += size;
        if self.extra_slices > 0 {
            loop {
                let mut merged = false;
                for i in 1..SLICE_NUM {
                    if self.slices[i].size != 0
                        && self.slices[i].offset == self.slices[0].size
                    {
                        self.slices[0].size += self.slices[i].size;
                        self.slices[i] = SliceSpan::default();
                        self.extra_slices -= 1;
                        self.merged += 1;
                        merged = true;
                    }
                }
                if !merged {
                    break;
                }
            }
        }

        if slice_size == 0 {
            return SliceOutcome::Accepted;
        }
        let ready = self.slices[0].size / slice_size;
        if ready > self.ready_slices {
            self.ready_slices = ready;
            SliceOutcome::Ready(ready)
        } else {
            SliceOutcome::Accepted
        }
    }
}

impl Default for SliceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural slot state, written only by the slot-owning thread.
pub struct SlotCtl {
    pub tmstamp: u32,
    pub seq_base32: u32,
    pub seq_base16: u16,
    pub seq_got: bool,
    pub frame: Option<Arc<FrameBuffer>>,
    pub first_pkt_ns: u64,
    /// ST 2110-22: combined jpvs+colr length on the first packet.
    pub st22_box_hdr_len: u16,
    /// ST 2110-22: codestream payload length of non-marker packets.
    pub st22_payload_len: u16,
    /// ST 2110-22: frame size announced by the marker packet, 0 until seen.
    pub st22_expect_size: u64,
}

impl SlotCtl {
    fn idle() -> Self {
        Self {
            tmstamp: 0,
            seq_base32: 0,
            seq_base16: 0,
            seq_got: false,
            frame: None,
            first_pkt_ns: 0,
            st22_box_hdr_len: 0,
            st22_payload_len: 0,
            st22_expect_size: 0,
        }
    }
}

pub struct Slot {
    pub idx: usize,
    pub ctl: RwLock<SlotCtl>,
    pub bitmap: Bitmap,
    /// Interlace field flag of the packets seen; per packet, so it lives
    /// outside the control word.
    pub second_field: AtomicBool,
    pub pkts_received: AtomicU32,
    pub pkts_redundant: AtomicU32,
    /// Bytes accounted by the tasklet path.
    pub recv_size: AtomicU64,
    /// Bytes accounted by the packet co-thread. The sum of both counters is
    /// the authoritative received size.
    pub co_recv_size: AtomicU64,
    pub slice: Option<Mutex<SliceTracker>>,
}

impl Slot {
    pub fn new(idx: usize, bitmap_bytes: usize, slice_mode: bool) -> Self {
        Self {
            idx,
            ctl: RwLock::new(SlotCtl::idle()),
            bitmap: Bitmap::new(bitmap_bytes),
            second_field: AtomicBool::new(false),
            pkts_received: AtomicU32::new(0),
            pkts_redundant: AtomicU32::new(0),
            recv_size: AtomicU64::new(0),
            co_recv_size: AtomicU64::new(0),
            slice: slice_mode.then(|| Mutex::new(SliceTracker::new())),
        }
    }

    pub fn frame_recv_size(&self) -> u64 {
        self.recv_size.load(Ordering::Acquire) + self.co_recv_size.load(Ordering::Acquire)
    }

    pub fn add_recv_size(&self, len: u64, co_thread: bool) {
        if co_thread {
            self.co_recv_size.fetch_add(len, Ordering::AcqRel);
        } else {
            self.recv_size.fetch_add(len, Ordering::AcqRel);
        }
    }

    /// Re-arm the slot for a new timestamp. Owner thread only; the caller
    /// already holds (or is about to drop into) the ctl write lock.
    pub fn rearm(&self, ctl: &mut SlotCtl, tmstamp: u32, first_pkt_ns: u64) {
        ctl.tmstamp = tmstamp;
        ctl.seq_got = false;
        ctl.frame = None;
        ctl.first_pkt_ns = first_pkt_ns;
        ctl.st22_box_hdr_len = 0;
        ctl.st22_payload_len = 0;
        ctl.st22_expect_size = 0;
        self.second_field.store(false, Ordering::Release);
        self.pkts_received.store(0, Ordering::Release);
        self.pkts_redundant.store(0, Ordering::Release);
        self.recv_size.store(0, Ordering::Release);
        self.co_recv_size.store(0, Ordering::Release);
        self.bitmap.clear_all();
        if let Some(slice) = &self.slice {
            slice.lock().reset();
        }
    }
}
