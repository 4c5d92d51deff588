//! Header-split receive plumbing.
//!
//! With header split the NIC lands every payload straight into a pre-mapped
//! region; the session only verifies placement. Buffers rotate through the
//! region in block-packing units: several frames worth plus the spare run
//! that lets a frame start mid-region, rotating back to zero whenever the
//! next full frame would not fit.

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::frame::PayloadRegion;
use crate::queue::PayloadSlotAlloc;

/// Block Packing Mode payload size; one region buffer per packet.
pub const BPM_PAYLOAD_SIZE: usize = 1200;

struct AllocState {
    alloc_idx: u32,
    cur_frame_mbuf_idx: u32,
    pool_ready: bool,
}

pub struct HdrSplitState {
    region: Arc<PayloadRegion>,
    mbufs_per_frame: u32,
    mbufs_total: u32,
    inner: Mutex<AllocState>,
}

impl HdrSplitState {
    pub fn new(frame_size: usize, frames_cnt: usize, iova: u64) -> Arc<Self> {
        let mut mbufs_per_frame = (frame_size / BPM_PAYLOAD_SIZE) as u32;
        if frame_size % BPM_PAYLOAD_SIZE != 0 {
            mbufs_per_frame += 1;
        }
        // spare run: a frame may begin anywhere within a frame-sized stride
        let mbufs_total = mbufs_per_frame * frames_cnt as u32 + (mbufs_per_frame - 1);
        let region = PayloadRegion::new(mbufs_total as usize * BPM_PAYLOAD_SIZE, iova);
        info!(
            "hdr split: {} buffers ({} per frame), region {} bytes",
            mbufs_total,
            mbufs_per_frame,
            region.len()
        );
        Arc::new(Self {
            region,
            mbufs_per_frame,
            mbufs_total,
            inner: Mutex::new(AllocState {
                alloc_idx: 0,
                cur_frame_mbuf_idx: 0,
                pool_ready: false,
            }),
        })
    }

    pub fn region(&self) -> &Arc<PayloadRegion> {
        &self.region
    }

    pub fn mbufs_per_frame(&self) -> u32 {
        self.mbufs_per_frame
    }

    pub fn mbufs_total(&self) -> u32 {
        self.mbufs_total
    }

    pub fn pool_ready(&self) -> bool {
        self.inner.lock().pool_ready
    }

    /// The receive handler pins the region index where the current frame
    /// started, so the allocator knows where frame boundaries fall.
    pub fn set_cur_frame_mbuf_idx(&self, idx: u32) -> bool {
        let mut st = self.inner.lock();
        st.cur_frame_mbuf_idx = idx;
        idx % self.mbufs_per_frame == 0
    }
}

impl PayloadSlotAlloc for HdrSplitState {
    fn next_payload_slot(&self) -> usize {
        let mut st = self.inner.lock();
        let mut alloc_idx = st.alloc_idx;

        if st.cur_frame_mbuf_idx != 0 {
            let next_frame_start = st.cur_frame_mbuf_idx + self.mbufs_per_frame;
            if alloc_idx == next_frame_start
                && alloc_idx + self.mbufs_per_frame >= self.mbufs_total
            {
                // the remaining run cannot hold a whole frame
                alloc_idx = 0;
            }
        } else {
            // warm-up: hand out the full region once before rotating
            let remaining = self.mbufs_total - alloc_idx;
            if remaining < self.mbufs_per_frame {
                alloc_idx = 0;
                st.pool_ready = true;
            }
        }

        let slot = alloc_idx as usize * BPM_PAYLOAD_SIZE;
        alloc_idx += 1;
        if alloc_idx >= self.mbufs_total {
            alloc_idx = 0;
            st.pool_ready = true;
        }
        st.alloc_idx = alloc_idx;
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_includes_spare_run() {
        let hs = HdrSplitState::new(5 * BPM_PAYLOAD_SIZE, 3, 0);
        assert_eq!(hs.mbufs_per_frame(), 5);
        assert_eq!(hs.mbufs_total(), 5 * 3 + 4);
        assert_eq!(hs.region().len(), 19 * BPM_PAYLOAD_SIZE);

        // ragged frame size rounds the per-frame count up
        let hs = HdrSplitState::new(5 * BPM_PAYLOAD_SIZE + 1, 2, 0);
        assert_eq!(hs.mbufs_per_frame(), 6);
    }

    #[test]
    fn warmup_hands_out_whole_region_then_rotates() {
        let hs = HdrSplitState::new(4 * BPM_PAYLOAD_SIZE, 2, 0);
        let total = hs.mbufs_total() as usize; // 11
        assert!(!hs.pool_ready());
        for i in 0..total {
            assert_eq!(hs.next_payload_slot(), i * BPM_PAYLOAD_SIZE);
        }
        assert!(hs.pool_ready());
        // rotated back to the start
        assert_eq!(hs.next_payload_slot(), 0);
    }

    #[test]
    fn rotates_to_zero_when_frame_would_not_fit() {
        let hs = HdrSplitState::new(4 * BPM_PAYLOAD_SIZE, 2, 0);
        // drain warm-up
        for _ in 0..hs.mbufs_total() {
            hs.next_payload_slot();
        }
        // pretend the current frame started at buffer 4
        hs.set_cur_frame_mbuf_idx(4);
        // allocator proceeds 0,1,2,... until it reaches the next frame
        // boundary (8); 8 + 4 > 11 so it rotates
        let mut slots = Vec::new();
        for _ in 0..9 {
            slots.push(hs.next_payload_slot() / BPM_PAYLOAD_SIZE);
        }
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5, 6, 7, 0]);
    }
}
