//! Session and per-port statistics. Everything is an atomic counter so the
//! receive path, the co-thread and the control tasklet can all bump without
//! coordination; the periodic dump reads and resets.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};

/// Public per-port counters, mirrored into [`PortStatsSnapshot`] on read.
#[derive(Default)]
pub struct PortStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub frames: AtomicU64,
    pub err_packets: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub frames: u64,
    pub err_packets: u64,
}

impl PortStats {
    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            err_packets: self.err_packets.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.frames.store(0, Ordering::Relaxed);
        self.err_packets.store(0, Ordering::Relaxed);
    }
}

/// Internal receive-path counters.
#[derive(Default)]
pub struct SessionStats {
    pub pkts_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_pkts_missed: AtomicU64,
    pub slices_received: AtomicU64,

    pub pkts_idx_dropped: AtomicU64,
    pub pkts_idx_oo_bitmap: AtomicU64,
    pub pkts_no_slot: AtomicU64,
    pub pkts_offset_dropped: AtomicU64,
    pub pkts_redundant_dropped: AtomicU64,
    pub pkts_wrong_hdr_dropped: AtomicU64,
    pub pkts_rtp_ring_full: AtomicU64,
    pub pkts_simulate_loss: AtomicU64,
    pub pkts_user_meta: AtomicU64,
    pub pkts_user_meta_err: AtomicU64,
    pub pkts_dma: AtomicU64,
    pub pkts_multi_segments: AtomicU64,
    pub pkts_not_bpm: AtomicU64,
    pub pkts_copy_hdr_split: AtomicU64,
    pub pkts_wrong_payload_hdr_split: AtomicU64,
    pub pkts_enqueue_fallback: AtomicU64,
    pub pkts_slice_fail: AtomicU64,
    pub pkts_slice_merged: AtomicU64,

    pub dma_previous_busy: AtomicU64,
    pub slot_get_frame_fail: AtomicU64,
    pub slot_query_ext_fail: AtomicU64,
    pub mismatch_hdr_split_frame: AtomicU64,
    pub vsync_mismatch: AtomicU64,

    // Busy-score inputs, cleared on every recomputation.
    pub nic_burst_cnt: AtomicU64,
    pub nic_inflight_cnt: AtomicU64,
    pub cbs_frame_slot_cnt: AtomicU64,
    pub cbs_incomplete_frame_cnt: AtomicU64,
}

#[inline]
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn add(counter: &AtomicU64, v: u64) {
    counter.fetch_add(v, Ordering::Relaxed);
}

fn take(counter: &AtomicU64) -> u64 {
    counter.swap(0, Ordering::Relaxed)
}

impl SessionStats {
    /// Periodic status dump; reads and resets the interval counters.
    pub fn dump_and_reset(&self, name: &str, elapsed_s: f64, cpu_busy: f32, dma_busy: f32) {
        let frames = take(&self.frames_received);
        let pkts = take(&self.pkts_received);
        let bytes = take(&self.bytes_received);
        let slices = take(&self.slices_received);
        let fps = if elapsed_s > 0.0 { frames as f64 / elapsed_s } else { 0.0 };
        let mbps = if elapsed_s > 0.0 {
            bytes as f64 * 8.0 / elapsed_s / 1_000_000.0
        } else {
            0.0
        };
        if slices > 0 {
            info!("rx[{name}]: fps {fps:.2} frames {frames} pkts {pkts} slices {slices}");
        } else {
            info!("rx[{name}]: fps {fps:.2} frames {frames} pkts {pkts}");
        }
        info!("rx[{name}]: throughput {mbps:.1} Mb/s, cpu busy {cpu_busy:.1}, dma busy {dma_busy:.1}");

        let frames_dropped = take(&self.frames_dropped);
        let idx_dropped = take(&self.pkts_idx_dropped);
        let offset_dropped = take(&self.pkts_offset_dropped);
        let oo_bitmap = take(&self.pkts_idx_oo_bitmap);
        let missed = take(&self.frames_pkts_missed);
        if frames_dropped + idx_dropped + offset_dropped > 0 {
            warn!(
                "rx[{name}]: incomplete frames {frames_dropped}, pkts (idx err {idx_dropped} \
                 offset err {offset_dropped} out of bitmap {oo_bitmap} missed {missed})"
            );
        }
        let ring_full = take(&self.pkts_rtp_ring_full);
        if ring_full > 0 {
            warn!("rx[{name}]: rtp ring full, dropped {ring_full}");
        }
        let no_slot = take(&self.pkts_no_slot);
        if no_slot > 0 {
            warn!("rx[{name}]: dropped {no_slot} pkts, no slot");
        }
        let redundant = take(&self.pkts_redundant_dropped);
        if redundant > 0 {
            info!("rx[{name}]: redundant pkts {redundant}");
        }
        let wrong_hdr = take(&self.pkts_wrong_hdr_dropped);
        if wrong_hdr > 0 {
            warn!("rx[{name}]: wrong hdr dropped {wrong_hdr}");
        }
        let fallback = take(&self.pkts_enqueue_fallback);
        if fallback > 0 {
            info!("rx[{name}]: co-thread ring full, {fallback} pkts handled inline");
        }
        let dma = take(&self.pkts_dma);
        if dma > 0 {
            info!("rx[{name}]: {dma} pkts by dma copy");
        }
        let slice_fail = take(&self.pkts_slice_fail);
        if slice_fail > 0 {
            warn!("rx[{name}]: {slice_fail} pkts dropped, slice add fail");
        }
        let slice_merged = take(&self.pkts_slice_merged);
        if slice_merged > 0 {
            info!("rx[{name}]: {slice_merged} out-of-order slice merges");
        }
        let multi_seg = take(&self.pkts_multi_segments);
        if multi_seg > 0 {
            warn!("rx[{name}]: multi segment pkts {multi_seg}");
        }
        let not_bpm = take(&self.pkts_not_bpm);
        if not_bpm > 0 {
            warn!("rx[{name}]: not bpm hdr split pkts {not_bpm}");
        }
        let wrong_split = take(&self.pkts_wrong_payload_hdr_split);
        if wrong_split > 0 {
            warn!("rx[{name}]: wrong payload hdr split pkts {wrong_split}");
        }
        let mismatch_split = take(&self.mismatch_hdr_split_frame);
        if mismatch_split > 0 {
            warn!("rx[{name}]: hdr split frame mismatch {mismatch_split}");
        }
        let copy_split = take(&self.pkts_copy_hdr_split);
        if copy_split > 0 {
            info!("rx[{name}]: hdr split copied pkts {copy_split}");
        }
        let vsync = take(&self.vsync_mismatch);
        if vsync > 0 {
            warn!("rx[{name}]: vsync mismatch {vsync}");
        }
        let frame_fail = take(&self.slot_get_frame_fail);
        if frame_fail > 0 {
            warn!("rx[{name}]: slot get frame fail {frame_fail}");
        }
        let query_fail = take(&self.slot_query_ext_fail);
        if query_fail > 0 {
            warn!("rx[{name}]: slot query ext frame fail {query_fail}");
        }
        let sim_loss = take(&self.pkts_simulate_loss);
        if sim_loss > 0 {
            info!("rx[{name}]: simulated loss dropped {sim_loss}");
        }
        let user_meta = take(&self.pkts_user_meta);
        let user_meta_err = take(&self.pkts_user_meta_err);
        if user_meta + user_meta_err > 0 {
            info!("rx[{name}]: user meta pkts {user_meta} invalid {user_meta_err}");
        }
    }
}
