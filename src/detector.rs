//! Format auto-detection from the first frames of an unknown stream.
//!
//! Samples `(rtp timestamp, cumulative packet count)` at three consecutive
//! frame markers, then resolves resolution from the highest row number,
//! frame rate from the timestamp delta and packing from what the payloads
//! looked like on the way past. Inconsistent samples are discarded and the
//! window restarts; detection never gives up on its own, only a dimension
//! miss is terminal.

use log::{debug, warn};

use crate::fmt::{dimension_from_max_line, fps_from_rtp_delta, Fps, Packing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectStatus {
    Detecting,
    Success,
    Fail,
    Disabled,
}

/// What detection concluded about the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectMeta {
    pub width: u32,
    pub height: u32,
    pub fps: Option<Fps>,
    pub packing: Option<Packing>,
    pub interlaced: bool,
}

pub struct Detector {
    pub status: DetectStatus,
    pub meta: DetectMeta,
    rtp_tm: [u32; 3],
    pkt_num: [u64; 3],
    frame_num: usize,
    bpm: bool,
    single_line: bool,
    pub pkt_per_frame: u32,
}

impl Detector {
    pub fn new() -> Self {
        Self {
            status: DetectStatus::Detecting,
            meta: DetectMeta::default(),
            rtp_tm: [0; 3],
            pkt_num: [0; 3],
            frame_num: 0,
            bpm: true,
            single_line: true,
            pkt_per_frame: 0,
        }
    }

    pub fn disabled() -> Self {
        let mut d = Self::new();
        d.status = DetectStatus::Disabled;
        d
    }

    /// Per-packet observations: packing hints and the interlace bit.
    pub fn on_pkt(&mut self, payload_len: u32, has_extra_srd: bool, second_field: bool) {
        if has_extra_srd {
            self.single_line = false;
        }
        if payload_len % 180 != 0 {
            self.bpm = false;
        }
        if second_field {
            self.meta.interlaced = true;
        }
    }

    /// Frame/field marker. `total_pkts` is the session's running received
    /// count, `max_line` the row number carried by the marker packet.
    /// Returns the status after this marker.
    pub fn on_marker(&mut self, tmstamp: u32, total_pkts: u64, max_line: u16) -> DetectStatus {
        if self.status != DetectStatus::Detecting {
            return self.status;
        }
        if self.frame_num < 3 {
            self.rtp_tm[self.frame_num] = tmstamp;
            self.pkt_num[self.frame_num] = total_pkts;
            self.frame_num += 1;
            return self.status;
        }

        self.calculate_dimension(max_line);
        self.calculate_fps();
        self.calculate_n_packet();
        self.calculate_packing();
        self.frame_num = 0;

        if self.meta.fps.is_some() && self.meta.packing.is_some() {
            if self.meta.height == 0 {
                self.status = DetectStatus::Fail;
            } else {
                self.status = DetectStatus::Success;
            }
        }
        self.status
    }

    fn calculate_dimension(&mut self, max_line: u16) {
        match dimension_from_max_line(max_line, self.meta.interlaced) {
            Some((w, h)) => {
                self.meta.width = w;
                self.meta.height = h;
            }
            None => warn!("detector: unmapped max line {max_line}"),
        }
    }

    fn calculate_fps(&mut self) {
        let d0 = self.rtp_tm[1].wrapping_sub(self.rtp_tm[0]) as i64;
        let d1 = self.rtp_tm[2].wrapping_sub(self.rtp_tm[1]) as i64;
        if (d0 - d1).abs() <= 1 {
            debug!("detector: rtp ts deltas {d0}/{d1}");
            match fps_from_rtp_delta(d0) {
                Some(fps) => self.meta.fps = Some(fps),
                None => warn!("detector: unmapped rtp ts delta {d0}"),
            }
        } else {
            warn!("detector: inconsistent rtp ts deltas {d0}/{d1}, resampling");
        }
    }

    fn calculate_n_packet(&mut self) {
        let total0 = self.pkt_num[1] - self.pkt_num[0];
        let total1 = self.pkt_num[2] - self.pkt_num[1];
        if total0 == total1 {
            self.pkt_per_frame = total0 as u32;
        } else {
            warn!("detector: inconsistent pkts per frame {total0}/{total1}, resampling");
        }
    }

    fn calculate_packing(&mut self) {
        self.meta.packing = Some(if self.bpm {
            Packing::Bpm
        } else if self.single_line {
            Packing::GpmSl
        } else {
            Packing::Gpm
        });
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_frames(d: &mut Detector, ts_step: &[u32], pkts_per_frame: u64, max_line: u16) {
        let mut ts = 0u32;
        let mut total = 0u64;
        for step in ts_step {
            total += pkts_per_frame;
            d.on_marker(ts, total, max_line);
            ts = ts.wrapping_add(*step);
        }
    }

    #[test]
    fn detects_720p59_94_bpm() {
        let mut d = Detector::new();
        for _ in 0..40 {
            d.on_pkt(1200, false, false);
        }
        run_frames(&mut d, &[1501, 1502, 1501], 1200, 719);
        assert_eq!(d.on_marker(4504, 4800, 719), DetectStatus::Success);
        assert_eq!(d.meta.width, 1280);
        assert_eq!(d.meta.height, 720);
        assert_eq!(d.meta.fps, Some(Fps::P59_94));
        assert_eq!(d.meta.packing, Some(Packing::Bpm));
        assert!(!d.meta.interlaced);
        assert_eq!(d.pkt_per_frame, 1200);
    }

    #[test]
    fn gpm_sl_when_odd_payload_no_continuation() {
        let mut d = Detector::new();
        d.on_pkt(1000, false, false);
        run_frames(&mut d, &[1500, 1500, 1500], 100, 1079);
        assert_eq!(d.on_marker(4500, 400, 1079), DetectStatus::Success);
        assert_eq!(d.meta.packing, Some(Packing::GpmSl));
    }

    #[test]
    fn gpm_when_continuation_seen() {
        let mut d = Detector::new();
        d.on_pkt(1000, true, false);
        run_frames(&mut d, &[3000, 3000, 3000], 100, 1079);
        assert_eq!(d.on_marker(9000, 400, 1079), DetectStatus::Success);
        assert_eq!(d.meta.packing, Some(Packing::Gpm));
        assert_eq!(d.meta.fps, Some(Fps::P30));
    }

    #[test]
    fn interlaced_dimension_table() {
        let mut d = Detector::new();
        d.on_pkt(1200, false, true);
        run_frames(&mut d, &[1800, 1800, 1800], 100, 539);
        assert_eq!(d.on_marker(5400, 400, 539), DetectStatus::Success);
        assert_eq!((d.meta.width, d.meta.height), (1920, 1080));
        assert!(d.meta.interlaced);
        assert_eq!(d.meta.fps, Some(Fps::P50));
    }

    #[test]
    fn unknown_dimension_is_terminal_fail() {
        let mut d = Detector::new();
        d.on_pkt(1200, false, false);
        run_frames(&mut d, &[1500, 1500, 1500], 100, 333);
        assert_eq!(d.on_marker(4500, 400, 333), DetectStatus::Fail);
    }

    #[test]
    fn inconsistent_deltas_resample_forever() {
        let mut d = Detector::new();
        d.on_pkt(1200, false, false);
        // wildly different deltas: fps stays unknown, detection continues
        run_frames(&mut d, &[1500, 4000, 1500], 100, 1079);
        assert_eq!(d.on_marker(7000, 400, 1079), DetectStatus::Detecting);
        // a consistent window afterwards succeeds
        run_frames(&mut d, &[1500, 1500, 1500], 100, 1079);
        assert_eq!(d.on_marker(7000, 800, 1079), DetectStatus::Success);
    }
}
