//! EBU/SMPTE timing compliance analyzer for the receive path.
//!
//! Per packet it tracks the instantaneous rate excursion (Cinst) and the
//! modelled receive buffer level (VRX); per frame the first-packet time,
//! end-to-end latency and the RTP timestamp behavior. Every 300 frames a
//! window closes with a narrow/wide/fail verdict per metric; the first four
//! windows are discarded while the stream settles.

use log::{error, info, warn};

use crate::fmt::Fps;

/// Cinst drain factor for the gapped sender profile.
const CINST_DRAIN_FACTOR: f64 = 1.1;
/// Latency window upper bound, ns.
const LATENCY_MAX_NS: f64 = 1_000_000_000.0;
/// Lowest acceptable RTP offset, ticks.
const RTP_OFFSET_MIN: f64 = -0.1;
/// Frames per verdict window.
const FRAMES_PER_WINDOW: u32 = 300;
/// Windows discarded at stream start.
const DROPPED_WINDOWS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Narrow,
    Wide,
    /// Wide pass under the software-timestamp workaround.
    WideWa,
    Pass,
    Fail,
}

impl Verdict {
    fn as_str(&self) -> &'static str {
        match self {
            Verdict::Narrow => "PASS NARROW",
            Verdict::Wide => "PASS WIDE",
            Verdict::WideWa => "PASS WIDE (WA)",
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        }
    }
}

/// Derived timing model and pass thresholds, fixed at init.
#[derive(Debug, Clone)]
pub struct EbuInfo {
    pub trs: f64,
    pub tr_offset: f64,
    pub c_max_narrow_pass: i32,
    pub c_max_wide_pass: i32,
    pub vrx_full_narrow_pass: i32,
    pub vrx_full_wide_pass: i32,
    pub rtp_offset_max_pass: i32,
}

#[derive(Debug, Default, Clone)]
struct Running {
    sum: f64,
    min: f64,
    max: f64,
    cnt: u32,
}

impl Running {
    fn clear(&mut self) {
        self.sum = 0.0;
        self.min = f64::MAX;
        self.max = f64::MIN;
        self.cnt = 0;
    }

    fn push(&mut self, v: f64) {
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.cnt += 1;
    }

    fn avg(&self) -> f64 {
        if self.cnt > 0 {
            self.sum / self.cnt as f64
        } else {
            -1.0
        }
    }
}

/// Accumulators for the current window.
#[derive(Debug, Default, Clone)]
struct EbuStat {
    frame_idx: u32,
    cur_epochs: u64,
    vrx_prev: i32,
    vrx_drained_prev: i32,
    cinst_initial_ns: u64,
    prev_rtp_ts: u32,
    prev_ipt_ns: u64,
    cinst: Running,
    vrx: Running,
    fpt: Running,
    latency: Running,
    rtp_offset: Running,
    rtp_ts_delta: Running,
    ipt: Running,
    compliant: bool,
    compliant_narrow: bool,
}

impl EbuStat {
    fn clear(&mut self) {
        *self = EbuStat::default();
        self.cinst.clear();
        self.vrx.clear();
        self.fpt.clear();
        self.latency.clear();
        self.rtp_offset.clear();
        self.rtp_ts_delta.clear();
        self.ipt.clear();
        self.compliant = true;
        self.compliant_narrow = true;
    }
}

/// Verdict counters across all closed windows.
#[derive(Debug, Default, Clone)]
pub struct EbuResult {
    pub windows: u32,
    pub compliance: u32,
    pub compliance_narrow: u32,
    pub cinst_pass_narrow: u32,
    pub cinst_pass_wide: u32,
    pub cinst_fail: u32,
    pub vrx_pass_narrow: u32,
    pub vrx_pass_wide: u32,
    pub vrx_fail: u32,
    pub fpt_pass: u32,
    pub fpt_fail: u32,
    pub latency_pass: u32,
    pub latency_fail: u32,
    pub rtp_offset_pass: u32,
    pub rtp_offset_fail: u32,
    pub rtp_ts_delta_pass: u32,
    pub rtp_ts_delta_fail: u32,
}

fn pass_rate(num: u32, of: u32) -> f64 {
    if of == 0 {
        0.0
    } else {
        num as f64 * 100.0 / of as f64
    }
}

pub struct EbuConfig {
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    pub fps: Fps,
    pub pkt_per_frame: u32,
}

pub struct EbuAnalyzer {
    info: EbuInfo,
    stat: EbuStat,
    result: EbuResult,
    frame_time: f64,
    frame_time_sampling: f64,
    dropped_windows: u32,
}

impl EbuAnalyzer {
    /// Build the timing model. Needs the packets-per-frame figure from the
    /// detector; without it there is no pacing reference.
    pub fn new(cfg: &EbuConfig) -> Option<Self> {
        if cfg.pkt_per_frame == 0 {
            error!("ebu: packets per frame unknown, analyzer disabled");
            return None;
        }
        let timing = cfg.fps.timing();
        let frame_time = cfg.fps.frame_time_ns();
        let frame_time_s = timing.den as f64 / timing.mul as f64;
        let total_pkts = cfg.pkt_per_frame as f64;

        let mut reactive = 1080.0 / 1125.0;
        if cfg.interlaced && cfg.height <= 576 {
            reactive = if cfg.height == 480 { 487.0 / 525.0 } else { 576.0 / 625.0 };
        }

        let trs = frame_time * reactive / total_pkts;
        let tr_offset = if !cfg.interlaced {
            if cfg.height >= 1080 {
                frame_time * (43.0 / 1125.0)
            } else {
                frame_time * (28.0 / 750.0)
            }
        } else if cfg.height == 480 {
            frame_time * (20.0 / 525.0) * 2.0
        } else if cfg.height == 576 {
            frame_time * (26.0 / 625.0) * 2.0
        } else {
            frame_time * (22.0 / 1125.0) * 2.0
        };

        let info = EbuInfo {
            trs,
            tr_offset,
            c_max_narrow_pass: 4i32.max((total_pkts / (43200.0 * reactive * frame_time_s)) as i32),
            c_max_wide_pass: 16i32.max((total_pkts / (21600.0 * frame_time_s)) as i32),
            vrx_full_narrow_pass: 8i32.max((total_pkts / (27000.0 * frame_time_s)) as i32),
            vrx_full_wide_pass: 720i32.max((total_pkts / (300.0 * frame_time_s)) as i32),
            rtp_offset_max_pass: ((tr_offset / 1_000_000_000.0)
                * timing.sampling_clock_rate as f64)
                .ceil() as i32
                + 1,
        };
        info!(
            "ebu: trs {:.3}ns tro {:.1}ns cmax {}/{} vrx {}/{} rtp_offset_max {}",
            info.trs,
            info.tr_offset,
            info.c_max_narrow_pass,
            info.c_max_wide_pass,
            info.vrx_full_narrow_pass,
            info.vrx_full_wide_pass,
            info.rtp_offset_max_pass
        );

        let mut stat = EbuStat::default();
        stat.clear();
        Some(Self {
            info,
            stat,
            result: EbuResult::default(),
            frame_time,
            frame_time_sampling: cfg.fps.frame_time_sampling(),
            dropped_windows: DROPPED_WINDOWS,
        })
    }

    pub fn info(&self) -> &EbuInfo {
        &self.info
    }

    pub fn result(&self) -> &EbuResult {
        &self.result
    }

    /// Feed one received packet. `pkt_idx` zero marks a new frame.
    pub fn on_packet(&mut self, rtp_ts: u32, pkt_ns: u64, pkt_idx: u32) {
        if pkt_idx == 0 {
            self.on_frame(rtp_ts, pkt_ns);
        }
        let trs = self.info.trs;
        let epoch_ns = self.stat.cur_epochs as f64 * self.frame_time;
        let tvd = epoch_ns + self.info.tr_offset;

        let packet_delta_ns = pkt_ns as f64 - tvd;
        let drained = ((packet_delta_ns + trs) / trs) as i32;
        let vrx_cur = self.stat.vrx_prev + 1 - (drained - self.stat.vrx_drained_prev);
        self.stat.vrx.push(vrx_cur as f64);
        self.stat.vrx_prev = vrx_cur;
        self.stat.vrx_drained_prev = drained;

        let exp_cin_pkts = ((pkt_ns.saturating_sub(self.stat.cinst_initial_ns)) as f64 / trs
            * CINST_DRAIN_FACTOR) as i64;
        let cinst = 0i64.max(pkt_idx as i64 - exp_cin_pkts);
        self.stat.cinst.push(cinst as f64);

        if self.stat.prev_ipt_ns != 0 {
            self.stat.ipt.push(pkt_ns as f64 - self.stat.prev_ipt_ns as f64);
        }
        self.stat.prev_ipt_ns = pkt_ns;
    }

    fn on_frame(&mut self, rtp_ts: u32, pkt_ns: u64) {
        self.stat.frame_idx += 1;
        if self.stat.frame_idx % FRAMES_PER_WINDOW == 0 {
            self.close_window();
        }

        let epochs = (pkt_ns as f64 / self.frame_time) as u64;
        let epoch_ns = epochs as f64 * self.frame_time;
        let fpt_delta = pkt_ns as f64 - epoch_ns;

        self.stat.cur_epochs = epochs;
        self.stat.vrx_prev = 0;
        self.stat.vrx_drained_prev = 0;
        self.stat.cinst_initial_ns = pkt_ns;
        self.stat.prev_ipt_ns = 0;

        self.stat.fpt.push(fpt_delta);

        let tmstamp64 = (epochs as f64 * self.frame_time_sampling) as u64;
        let tmstamp32 = tmstamp64 as u32;
        let diff_rtp_ts = rtp_ts.wrapping_sub(tmstamp32) as i32 as f64;
        let diff_rtp_ts_ns = diff_rtp_ts * self.frame_time / self.frame_time_sampling;
        let latency = fpt_delta - diff_rtp_ts_ns;
        self.stat.latency.push(latency);
        self.stat.rtp_offset.push(diff_rtp_ts);

        if self.stat.prev_rtp_ts != 0 {
            let delta = rtp_ts.wrapping_sub(self.stat.prev_rtp_ts) as i32;
            self.stat.rtp_ts_delta.push(delta as f64);
        }
        self.stat.prev_rtp_ts = rtp_ts;
    }

    fn close_window(&mut self) {
        self.result.windows += 1;
        if self.dropped_windows > 0 {
            if self.result.windows > self.dropped_windows {
                self.dropped_windows = 0;
                self.result.windows = 0;
            }
        } else {
            self.window_verdicts();
        }
        self.stat.clear();
    }

    fn window_verdicts(&mut self) {
        let cinst = self.cinst_verdict();
        let vrx = self.vrx_verdict();
        let fpt = self.fpt_verdict();
        let latency = self.latency_verdict();
        let rtp_offset = self.rtp_offset_verdict();
        let rtp_ts_delta = self.rtp_ts_delta_verdict();

        info!(
            "ebu: Cinst avg {:.2} min {} max {} {}",
            self.stat.cinst.avg(),
            self.stat.cinst.min as i64,
            self.stat.cinst.max as i64,
            cinst.as_str()
        );
        info!(
            "ebu: VRX avg {:.2} min {} max {} {}",
            self.stat.vrx.avg(),
            self.stat.vrx.min as i64,
            self.stat.vrx.max as i64,
            vrx.as_str()
        );
        info!(
            "ebu: FPT avg {:.2} min {} max {} {}",
            self.stat.fpt.avg(),
            self.stat.fpt.min as i64,
            self.stat.fpt.max as i64,
            fpt.as_str()
        );
        info!(
            "ebu: latency avg {:.2} min {} max {} {}",
            self.stat.latency.avg(),
            self.stat.latency.min as i64,
            self.stat.latency.max as i64,
            latency.as_str()
        );
        info!(
            "ebu: RTP offset avg {:.2} min {} max {} {}",
            self.stat.rtp_offset.avg(),
            self.stat.rtp_offset.min as i64,
            self.stat.rtp_offset.max as i64,
            rtp_offset.as_str()
        );
        info!(
            "ebu: RTP ts delta avg {:.2} min {} max {} {}",
            self.stat.rtp_ts_delta.avg(),
            self.stat.rtp_ts_delta.min as i64,
            self.stat.rtp_ts_delta.max as i64,
            rtp_ts_delta.as_str()
        );
        info!(
            "ebu: inter-packet time avg {:.2} min {} max {}",
            self.stat.ipt.avg(),
            self.stat.ipt.min as i64,
            self.stat.ipt.max as i64
        );

        if self.stat.compliant {
            self.result.compliance += 1;
            if self.stat.compliant_narrow {
                self.result.compliance_narrow += 1;
            }
        }
    }

    fn cinst_verdict(&mut self) -> Verdict {
        let max = self.stat.cinst.max as i32;
        if max <= self.info.c_max_narrow_pass {
            self.result.cinst_pass_narrow += 1;
            return Verdict::Narrow;
        }
        if max <= self.info.c_max_wide_pass {
            self.result.cinst_pass_wide += 1;
            self.stat.compliant_narrow = false;
            return Verdict::Wide;
        }
        if max <= self.info.c_max_wide_pass * 16 {
            // software receive timestamps are not accurate enough for a
            // hard fail here
            self.result.cinst_pass_wide += 1;
            self.stat.compliant_narrow = false;
            return Verdict::WideWa;
        }
        self.result.cinst_fail += 1;
        self.stat.compliant = false;
        Verdict::Fail
    }

    fn vrx_verdict(&mut self) -> Verdict {
        let min = self.stat.vrx.min as i32;
        let max = self.stat.vrx.max as i32;
        if min >= 0 && max <= self.info.vrx_full_narrow_pass {
            self.result.vrx_pass_narrow += 1;
            return Verdict::Narrow;
        }
        if min >= 0 && max <= self.info.vrx_full_wide_pass {
            self.result.vrx_pass_wide += 1;
            self.stat.compliant_narrow = false;
            return Verdict::Wide;
        }
        self.result.vrx_fail += 1;
        self.stat.compliant = false;
        Verdict::Fail
    }

    fn fpt_verdict(&mut self) -> Verdict {
        if self.stat.fpt.max <= self.info.tr_offset {
            self.result.fpt_pass += 1;
            return Verdict::Pass;
        }
        if self.stat.fpt.max <= self.info.tr_offset * 2.0 {
            // no hardware receive timestamps
            self.result.fpt_pass += 1;
            return Verdict::WideWa;
        }
        self.result.fpt_fail += 1;
        self.stat.compliant = false;
        Verdict::Fail
    }

    fn latency_verdict(&mut self) -> Verdict {
        if self.stat.latency.min < 0.0 || self.stat.latency.max > LATENCY_MAX_NS {
            self.result.latency_fail += 1;
            self.stat.compliant = false;
            return Verdict::Fail;
        }
        self.result.latency_pass += 1;
        Verdict::Pass
    }

    fn rtp_offset_verdict(&mut self) -> Verdict {
        if self.stat.rtp_offset.min < RTP_OFFSET_MIN
            || self.stat.rtp_offset.max > self.info.rtp_offset_max_pass as f64
        {
            self.result.rtp_offset_fail += 1;
            self.stat.compliant = false;
            return Verdict::Fail;
        }
        self.result.rtp_offset_pass += 1;
        Verdict::Pass
    }

    fn rtp_ts_delta_verdict(&mut self) -> Verdict {
        let rtd = self.frame_time_sampling as i32 as f64;
        if self.stat.rtp_ts_delta.min < rtd || self.stat.rtp_ts_delta.max > rtd + 1.0 {
            self.result.rtp_ts_delta_fail += 1;
            self.stat.compliant = false;
            return Verdict::Fail;
        }
        self.result.rtp_ts_delta_pass += 1;
        Verdict::Pass
    }

    /// Log the aggregate compliance picture; called at session detach.
    pub fn final_summary(&self, name: &str) {
        let r = &self.result;
        if r.windows == 0 {
            warn!("ebu[{name}]: not enough windows for a result");
            return;
        }
        info!(
            "ebu[{name}]: {} windows, compliance narrow {:.2}% wide {:.2}%",
            r.windows,
            pass_rate(r.compliance_narrow, r.windows),
            pass_rate(r.compliance - r.compliance_narrow, r.windows)
        );
        info!(
            "ebu[{name}]: Cinst narrow {:.2}% wide {:.2}% fail {:.2}%",
            pass_rate(r.cinst_pass_narrow, r.windows),
            pass_rate(r.cinst_pass_wide, r.windows),
            pass_rate(r.cinst_fail, r.windows)
        );
        info!(
            "ebu[{name}]: VRX narrow {:.2}% wide {:.2}% fail {:.2}%",
            pass_rate(r.vrx_pass_narrow, r.windows),
            pass_rate(r.vrx_pass_wide, r.windows),
            pass_rate(r.vrx_fail, r.windows)
        );
        info!(
            "ebu[{name}]: FPT pass {:.2}% latency pass {:.2}% rtp offset pass {:.2}% rtp ts delta pass {:.2}%",
            pass_rate(r.fpt_pass, r.windows),
            pass_rate(r.latency_pass, r.windows),
            pass_rate(r.rtp_offset_pass, r.windows),
            pass_rate(r.rtp_ts_delta_pass, r.windows)
        );
    }
}
