//! One receive-video session: derived geometry, resource attach/detach,
//! the per-port receive loop, redundancy, vsync and the packet co-thread.
//!
//! The manager owns sessions; everything the packet handlers and the
//! optional co-thread share lives in [`SessionCore`] behind an `Arc`.

mod handlers;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::clock::Clock;
use crate::detector::{DetectStatus, Detector};
use crate::dma::{DmaLender, DmaProvider, DmaRequest};
use crate::ebu::{EbuAnalyzer, EbuConfig};
use crate::error::{Error, PktDropReason};
use crate::fmt::{bandwidth_bps, Fps, Packing, PixelFormat, PixelGroup};
use crate::frame::{FramePool, PoolConfig, PoolKind};
use crate::hdr_split::HdrSplitState;
use crate::ops::{RxFlags, RxOps, SessionEvent, SessionEvents, SessionType, St22Ops};
use crate::queue::{HdrSplitFlow, Mbuf, QueueBackend, RxFlow, RxQueue, MAX_UDP_PAYLOAD};
use crate::rtcp::{NackTx, RtcpRx, UdpNackTx};
use crate::rtp::{RtpHeader, RFC4175_HDR_LEN, RTP_HDR_LEN};
use crate::slot::{Slot, SLOT_COUNT};
use crate::stats::{add, bump, PortStats, SessionStats};

/// Packets pulled per queue per tasklet pass.
pub const RX_BURST_SIZE: usize = 128;
/// Payloads below this stay on the CPU even with a DMA lender.
const DMA_MIN_COPY_SIZE: usize = 60;
/// DMA descriptor ring depth requested per session.
const DMA_NB_DESC: u16 = 128;
/// Sessions above this payload bit rate get a dedicated packet thread.
const PKT_COTHREAD_BPS: u64 = 40_000_000_000;
/// Periodic statistics dump interval.
const STAT_INTERVAL_NS: u64 = 10_000_000_000;
/// Redundant packets must fall this far short of primary before a frame is
/// downgraded from Complete to Reconstructed.
const RECONSTRUCT_SLACK_PKTS: u32 = 16;

/// Who is running the packet handler right now.
#[derive(Clone, Copy)]
pub(crate) struct PktCtx {
    pub port: usize,
    /// May capture the sequence base and mutate slot structure.
    pub slot_owner: bool,
    /// Accounts into the co-thread size counter.
    pub co_thread: bool,
}

/// Geometry derived from the configured (or detected) format.
#[derive(Debug, Clone)]
pub(crate) struct Geometry {
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub fmt: PixelFormat,
    pub interlaced: bool,
    #[allow(dead_code)]
    pub packing: Packing,
    pub pg: PixelGroup,
    pub frame_time: f64,
    pub frame_time_sampling: f64,
    pub bytes_in_line: usize,
    pub linesize: usize,
    pub fb_size: usize,
    pub frame_size: u64,
    pub uframe_size: u64,
    pub bitmap_bytes: usize,
    pub slice_lines: u32,
    pub slice_size: u32,
}

pub(crate) fn derive_geometry(ops: &RxOps, st22: Option<&St22Ops>) -> Result<Geometry, Error> {
    let pg = ops.fmt.pixel_group();
    let bytes_in_line = (ops.width as usize) * pg.size as usize / pg.coverage as usize;
    let mut linesize = bytes_in_line;
    if ops.linesize > linesize {
        linesize = ops.linesize;
    } else if ops.linesize != 0 && ops.linesize < bytes_in_line {
        return Err(Error::InvalidOps("linesize below bytes per line"));
    }

    let mut fb_size = linesize * ops.height as usize;
    let mut frame_size = match st22 {
        Some(st22) => st22.framebuff_max_size as u64,
        None => (ops.width as u64) * (ops.height as u64) * pg.size as u64 / pg.coverage as u64,
    };
    if st22.is_some() {
        fb_size = frame_size as usize;
    }
    if ops.interlaced {
        frame_size /= 2;
        fb_size /= 2;
    }

    // at least 800 payload bytes per packet, and room for two packets per
    // line whatever the format
    let mut bitmap_bytes = (frame_size / 800 / 8) as usize;
    let min_bitmap = ops.height as usize * 2 / 8;
    if bitmap_bytes < min_bitmap {
        bitmap_bytes = min_bitmap;
    }

    let slice_lines = if ops.slice_lines != 0 { ops.slice_lines } else { ops.height / 32 };
    let slice_size =
        ops.width * slice_lines * pg.size / pg.coverage;

    Ok(Geometry {
        width: ops.width,
        height: ops.height,
        fps: ops.fps,
        fmt: ops.fmt,
        interlaced: ops.interlaced,
        packing: ops.packing,
        pg,
        frame_time: ops.fps.frame_time_ns(),
        frame_time_sampling: ops.fps.frame_time_sampling(),
        bytes_in_line,
        linesize,
        fb_size,
        frame_size,
        uframe_size: ops.uframe_size,
        bitmap_bytes,
        slice_lines,
        slice_size,
    })
}

fn ops_check(ops: &RxOps) -> Result<(), Error> {
    let num_ports = ops.num_ports();
    if num_ports == 0 || num_ports > 2 {
        return Err(Error::InvalidOps("need one or two source ports"));
    }
    if num_ports == 2 && ops.sources[0].ip == ops.sources[1].ip {
        return Err(Error::InvalidOps("redundant ports must use distinct sources"));
    }
    if !(96..=127).contains(&ops.payload_type) {
        return Err(Error::InvalidOps("payload type outside dynamic range"));
    }
    match ops.session_type {
        SessionType::Frame | SessionType::Slice => {
            if ops.framebuff_cnt < 2 {
                return Err(Error::InvalidOps("framebuff_cnt must be at least 2"));
            }
            if ops.session_type == SessionType::Slice && !ops.flags.receive_incomplete_frame {
                return Err(Error::InvalidOps("slice mode needs incomplete-frame delivery"));
            }
        }
        SessionType::Rtp => {
            if ops.rtp_ring_size == 0 {
                return Err(Error::InvalidOps("rtp mode needs a ring size"));
            }
        }
    }
    if ops.dynamic_ext_frame && !ops.flags.receive_incomplete_frame {
        return Err(Error::InvalidOps("dynamic ext frames need incomplete-frame delivery"));
    }
    if ops.flags.hdr_split {
        if num_ports > 1 {
            return Err(Error::InvalidOps("header split is single port only"));
        }
        if ops.flags.auto_detect {
            return Err(Error::InvalidOps("header split cannot auto-detect"));
        }
    }
    if let Some(ext) = &ops.ext_frames {
        if ext.len() < ops.framebuff_cnt {
            return Err(Error::InvalidOps("not enough external frames"));
        }
    }
    if ops.st22.is_some() && (ops.flags.auto_detect || ops.flags.timing_analysis) {
        return Err(Error::InvalidOps("detection applies to uncompressed video only"));
    }
    Ok(())
}

/// State shared between the tasklet thread and the packet co-thread.
pub(crate) struct SessionCore {
    pub name: String,
    pub idx: usize,
    pub geo: Geometry,
    pub payload_type: u8,
    pub session_type: SessionType,
    pub flags: RxFlags,
    pub st22: Option<St22Ops>,
    pub dynamic_ext: bool,
    pub num_ports: usize,
    pub slots: Vec<Slot>,
    pub slot_max: usize,
    pub slot_rr: AtomicUsize,
    pub pool: Option<Arc<FramePool>>,
    pub events: Arc<dyn SessionEvents>,
    pub stats: Arc<SessionStats>,
    pub port_stats: Arc<[PortStats; 2]>,
    pub ebu: Option<Mutex<EbuAnalyzer>>,
    pub clock: Arc<dyn Clock>,
    pub hdr_split: Option<Arc<HdrSplitState>>,
    pub rtp_prod: Option<Mutex<HeapProd<Mbuf>>>,
}

/// The session side of a DMA lender loan.
pub(crate) struct DmaCtx {
    pub lender: Box<dyn DmaLender>,
    /// Slot currently receiving DMA writes.
    pub dma_slot: Option<usize>,
    /// A copy was enqueued since the last submit.
    pub copied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Detect,
    DetectErr,
    Frame,
    St22,
    HdrSplit,
    Rtp,
}

struct CoThread {
    prod: HeapProd<Mbuf>,
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct SimLoss {
    rng: u64,
    burst_cnt: u32,
    burst_max: u32,
    rate: f32,
}

impl SimLoss {
    fn new(idx: usize, burst_max: u32, rate: f32) -> Self {
        Self {
            rng: 0x9E37_79B9_7F4A_7C15 ^ (idx as u64 + 1),
            burst_cnt: 0,
            burst_max: if burst_max != 0 { burst_max } else { 32 },
            rate: if rate > 0.0 && rate < 1.0 { rate } else { 0.0001 },
        }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*, plenty for a loss model
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn drop_pkt(&mut self) -> bool {
        if self.burst_cnt == 0 {
            let roll = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
            if (roll as f32) < self.rate {
                self.burst_cnt = (self.next_u64() % self.burst_max as u64) as u32 + 1;
            } else {
                return false;
            }
        }
        self.burst_cnt -= 1;
        true
    }
}

struct VsyncState {
    frame_time: f64,
    next_epoch_ns: u64,
    epoch: u64,
}

impl VsyncState {
    fn new(frame_time: f64, now_ns: u64) -> Self {
        let epoch = (now_ns as f64 / frame_time) as u64 + 1;
        Self { frame_time, next_epoch_ns: (epoch as f64 * frame_time) as u64, epoch }
    }

    fn advance(&mut self, now_ns: u64) {
        self.epoch = (now_ns as f64 / self.frame_time) as u64 + 1;
        self.next_epoch_ns = (self.epoch as f64 * self.frame_time) as u64;
    }
}

/// External services a session borrows from its manager.
#[derive(Clone)]
pub(crate) struct SessionDeps {
    pub backend: Arc<dyn QueueBackend>,
    pub dma: Option<Arc<dyn DmaProvider>>,
    pub clock: Arc<dyn Clock>,
    /// PA-IOVA hugepage size; frames get page tables when set.
    pub dma_page_size: Option<usize>,
}

pub(crate) struct Session {
    pub idx: usize,
    ops: RxOps,
    deps: SessionDeps,
    geo: Option<Geometry>,
    core: Option<Arc<SessionCore>>,
    handler: Handler,
    detector: Detector,
    queues: Vec<Option<Box<dyn RxQueue>>>,
    dst_ports: Vec<u16>,
    rtcp: Vec<Option<RtcpRx>>,
    nack_tx: Option<Arc<dyn NackTx>>,
    rtp_cons: Option<HeapCons<Mbuf>>,
    dma: Option<DmaCtx>,
    co: Option<CoThread>,
    hdr_split: Option<Arc<HdrSplitState>>,
    vsync: Option<VsyncState>,
    sim_loss: SimLoss,
    stats: Arc<SessionStats>,
    port_stats: Arc<[PortStats; 2]>,
    pub advice_sleep_us: u64,
    pub cpu_busy_score: f32,
    pub dma_busy_score: f32,
    stat_last_ns: u64,
    detect_err_logged: bool,
    attached: bool,
}

impl Session {
    pub fn attach(idx: usize, ops: RxOps, deps: SessionDeps) -> Result<Self, Error> {
        ops_check(&ops)?;
        let num_ports = ops.num_ports();
        let dst_ports: Vec<u16> = ops
            .sources
            .iter()
            .map(|s| if s.udp_port != 0 { s.udp_port } else { 10_000 + idx as u16 * 2 })
            .collect();

        let mut s = Session {
            idx,
            sim_loss: SimLoss::new(idx, ops.burst_loss_max, ops.sim_loss_rate),
            ops,
            deps: deps.clone(),
            geo: None,
            core: None,
            handler: Handler::DetectErr,
            detector: Detector::disabled(),
            queues: (0..num_ports).map(|_| None).collect(),
            dst_ports,
            rtcp: (0..num_ports).map(|_| None).collect(),
            nack_tx: None,
            rtp_cons: None,
            dma: None,
            co: None,
            hdr_split: None,
            vsync: None,
            stats: Arc::new(SessionStats::default()),
            port_stats: Arc::new([PortStats::default(), PortStats::default()]),
            advice_sleep_us: 0,
            cpu_busy_score: 0.0,
            dma_busy_score: 0.0,
            stat_last_ns: deps.clock.now_ns(),
            detect_err_logged: false,
            attached: false,
        };

        // Header split sizes its payload region from the configured format,
        // so the region must exist before the queues are taken.
        if s.ops.flags.hdr_split {
            let geo = derive_geometry(&s.ops, s.ops.st22.as_ref())?;
            s.hdr_split = Some(HdrSplitState::new(geo.fb_size, s.ops.framebuff_cnt, 0x10_0000));
            s.geo = Some(geo);
        }

        s.init_hw()?;

        let wants_detect = s.ops.st22.is_none()
            && s.ops.session_type != SessionType::Rtp
            && (s.ops.flags.auto_detect || s.ops.flags.timing_analysis);
        if wants_detect {
            s.detector = Detector::new();
        } else if let Err(e) = s.init_sw() {
            s.uninit_hw();
            return Err(e);
        }

        if let Err(e) = s.init_mcast() {
            s.uninit_sw();
            s.uninit_hw();
            return Err(e);
        }

        if s.ops.flags.enable_rtcp {
            if let Err(e) = s.init_rtcp() {
                s.uninit_mcast();
                s.uninit_sw();
                s.uninit_hw();
                return Err(e);
            }
        }

        s.handler = s.select_handler();
        s.attached = true;
        info!(
            "rx[{}]: attached, {} port(s), type {:?}, detect {}",
            s.ops.name,
            num_ports,
            s.ops.session_type,
            if wants_detect { "pending" } else { "off" }
        );
        Ok(s)
    }

    fn init_hw(&mut self) -> Result<(), Error> {
        for port in 0..self.ops.num_ports() {
            let hdr_split = self.hdr_split.as_ref().map(|hs| HdrSplitFlow {
                region: hs.region().clone(),
                alloc: hs.clone(),
            });
            let flow = RxFlow {
                src_ip: Some(self.ops.sources[port].ip),
                dst_ip: Some(self.ops.sources[port].ip),
                dst_port: self.dst_ports[port],
                hdr_split,
                use_cni_queue: false,
            };
            match self.deps.backend.get(port, &flow) {
                Ok(q) => self.queues[port] = Some(q),
                Err(e) => {
                    self.uninit_hw();
                    return Err(e);
                }
            }
            debug!("rx[{}]: port {} on udp {}", self.ops.name, port, self.dst_ports[port]);
        }
        Ok(())
    }

    fn uninit_hw(&mut self) {
        for q in self.queues.iter_mut() {
            if let Some(q) = q.take() {
                self.deps.backend.put(q);
            }
        }
    }

    fn init_mcast(&mut self) -> Result<(), Error> {
        for port in 0..self.ops.num_ports() {
            let ip = self.ops.sources[port].ip;
            if !ip.is_multicast() {
                continue;
            }
            if let Err(e) = self.deps.backend.join_multicast(port, ip) {
                // roll back earlier joins
                for p in 0..port {
                    let ip = self.ops.sources[p].ip;
                    if ip.is_multicast() {
                        self.deps.backend.leave_multicast(p, ip);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn uninit_mcast(&mut self) {
        for port in 0..self.ops.num_ports() {
            let ip = self.ops.sources[port].ip;
            if ip.is_multicast() {
                self.deps.backend.leave_multicast(port, ip);
            }
        }
    }

    fn init_rtcp(&mut self) -> Result<(), Error> {
        for port in 0..self.ops.num_ports() {
            let name = format!("{}p{}", self.ops.name, port);
            self.rtcp[port] = Some(RtcpRx::new(&name, &self.ops.rtcp, 0x5354_3230));
        }
        if self.nack_tx.is_none() {
            if let Some(tx) = &self.ops.nack_tx {
                self.nack_tx = Some(tx.clone());
            } else {
                match UdpNackTx::new(self.ops.sources[0].ip, self.dst_ports[0]) {
                    Ok(tx) => self.nack_tx = Some(Arc::new(tx)),
                    Err(e) => {
                        warn!("rx[{}]: nack tx socket unavailable: {e}", self.ops.name);
                    }
                }
            }
        }
        Ok(())
    }

    fn uninit_rtcp(&mut self) {
        for r in self.rtcp.iter_mut() {
            *r = None;
        }
    }

    /// Software side: frames, slots, DMA, co-thread, analyzer, vsync. For
    /// auto-detect sessions this runs only after the detector succeeds.
    fn init_sw(&mut self) -> Result<(), Error> {
        let geo = match &self.geo {
            Some(geo) => geo.clone(),
            None => {
                let geo = derive_geometry(&self.ops, self.ops.st22.as_ref())?;
                self.geo = Some(geo.clone());
                geo
            }
        };

        let slice_mode = self.ops.session_type == SessionType::Slice;
        let mut pool = None;
        let mut rtp_prod = None;
        match self.ops.session_type {
            SessionType::Frame | SessionType::Slice => {
                let kind = if self.ops.flags.hdr_split {
                    PoolKind::Region
                } else if let Some(ext) = &self.ops.ext_frames {
                    PoolKind::Ext(ext.clone())
                } else if self.ops.dynamic_ext_frame {
                    PoolKind::Dynamic
                } else {
                    PoolKind::Owned { page_size: self.deps.dma_page_size }
                };
                let alloc_size =
                    if geo.uframe_size != 0 { geo.uframe_size as usize } else { geo.fb_size };
                pool = Some(Arc::new(FramePool::new(PoolConfig {
                    count: self.ops.framebuff_cnt,
                    frame_size: alloc_size,
                    user_meta_size: MAX_UDP_PAYLOAD - RTP_HDR_LEN - RFC4175_HDR_LEN,
                    kind,
                })?));
            }
            SessionType::Rtp => {
                let rb = HeapRb::<Mbuf>::new(self.ops.rtp_ring_size);
                let (prod, cons) = rb.split();
                rtp_prod = Some(Mutex::new(prod));
                self.rtp_cons = Some(cons);
            }
        }

        let slots: Vec<Slot> =
            (0..SLOT_COUNT).map(|i| Slot::new(i, geo.bitmap_bytes.max(2), slice_mode)).collect();

        // DMA lender, when the mode allows one.
        let frame_mode = self.ops.session_type != SessionType::Rtp;
        if frame_mode
            && self.ops.flags.dma_offload
            && geo.uframe_size == 0
            && !self.ops.flags.hdr_split
        {
            if let Some(provider) = &self.deps.dma {
                match provider.request(&DmaRequest { nb_desc: DMA_NB_DESC, max_shared: 16 }) {
                    Some(lender) => {
                        self.dma = Some(DmaCtx { lender, dma_slot: None, copied: false });
                        info!("rx[{}]: dma lender attached", self.ops.name);
                    }
                    None => info!("rx[{}]: no dma lender available", self.ops.name),
                }
            }
        }

        // Dedicated packet thread for very fat streams.
        let bps = bandwidth_bps(geo.width, geo.height, geo.fmt, geo.fps, geo.interlaced);
        let want_cothread = frame_mode
            && self.ops.st22.is_none()
            && bps > PKT_COTHREAD_BPS
            && self.dma.is_none()
            && !self.ops.flags.hdr_split;
        if want_cothread && slice_mode {
            return Err(Error::InvalidOps("slice mode cannot use the packet co-thread"));
        }

        let slot_max = if want_cothread {
            SLOT_COUNT
        } else if self.ops.session_type == SessionType::Rtp {
            SLOT_COUNT
        } else if self.ops.flags.enable_rtcp {
            2
        } else {
            1
        };

        let ebu = if self.ops.flags.timing_analysis {
            EbuAnalyzer::new(&EbuConfig {
                width: geo.width,
                height: geo.height,
                interlaced: geo.interlaced,
                fps: geo.fps,
                pkt_per_frame: self.detector.pkt_per_frame,
            })
            .map(Mutex::new)
        } else {
            None
        };

        let core = Arc::new(SessionCore {
            name: self.ops.name.clone(),
            idx: self.idx,
            geo: geo.clone(),
            payload_type: self.ops.payload_type,
            session_type: self.ops.session_type,
            flags: self.ops.flags,
            st22: self.ops.st22,
            dynamic_ext: self.ops.dynamic_ext_frame,
            num_ports: self.ops.num_ports(),
            slots,
            slot_max,
            slot_rr: AtomicUsize::new(0),
            pool,
            events: self.ops.events.clone(),
            stats: self.stats.clone(),
            port_stats: self.port_stats.clone(),
            ebu,
            clock: self.deps.clock.clone(),
            hdr_split: self.hdr_split.clone(),
            rtp_prod,
        });

        if want_cothread {
            let rb = HeapRb::<Mbuf>::new(RX_BURST_SIZE * 4);
            let (prod, mut cons) = rb.split();
            let active = Arc::new(AtomicBool::new(true));
            let worker_active = active.clone();
            let worker_core = core.clone();
            let handle = std::thread::Builder::new()
                .name(format!("st-rx-pkt-{}", self.idx))
                .spawn(move || {
                    // the packet thread competes with the scheduler thread
                    // for cycles; ask for a little more, best effort
                    #[cfg(unix)]
                    unsafe {
                        libc::nice(-10);
                    }
                    info!("rx[{}]: packet co-thread up", worker_core.name);
                    let mut no_dma: Option<DmaCtx> = None;
                    let ctx = PktCtx { port: 0, slot_owner: true, co_thread: true };
                    while worker_active.load(Ordering::Acquire) {
                        match cons.try_pop() {
                            Some(mbuf) => {
                                let _ = handlers::handle_frame_pkt(
                                    &worker_core,
                                    &mut no_dma,
                                    &mbuf,
                                    ctx,
                                );
                            }
                            None => std::thread::yield_now(),
                        }
                    }
                    info!("rx[{}]: packet co-thread down", worker_core.name);
                })
                .map_err(|e| Error::Queue(format!("co-thread spawn: {e}")))?;
            self.co = Some(CoThread { prod, active, handle: Some(handle) });
            info!("rx[{}]: packet co-thread enabled ({} bps)", self.ops.name, bps);
        }

        if self.ops.flags.enable_vsync {
            self.vsync = Some(VsyncState::new(geo.frame_time, self.deps.clock.now_ns()));
        }

        // sleep hint: about one burst of packets at nominal pacing
        let estimated_pkts = (geo.frame_size as usize / 1200).max(1);
        let trs = geo.frame_time / estimated_pkts as f64;
        self.advice_sleep_us = (trs * RX_BURST_SIZE as f64 / 1_000.0) as u64;

        self.core = Some(core);
        info!(
            "rx[{}]: {} frames of {} bytes, bitmap {} bytes, slots {}",
            self.ops.name, self.ops.framebuff_cnt, geo.frame_size, geo.bitmap_bytes, slot_max
        );
        Ok(())
    }

    fn uninit_sw(&mut self) {
        if let Some(mut co) = self.co.take() {
            co.active.store(false, Ordering::Release);
            if let Some(h) = co.handle.take() {
                let _ = h.join();
            }
        }
        if let Some(dma) = &mut self.dma {
            // flush whatever the engine still holds
            dma.lender.submit();
            while !dma.lender.empty() {
                if dma.lender.completed(RX_BURST_SIZE, None) == 0 {
                    break;
                }
            }
        }
        self.dma = None;
        if let Some(core) = &self.core {
            for slot in &core.slots {
                let mut ctl = slot.ctl.write();
                if let (Some(frame), Some(pool)) = (ctl.frame.take(), core.pool.as_ref()) {
                    pool.put(&frame);
                }
            }
        }
        self.core = None;
        self.rtp_cons = None;
        self.vsync = None;
    }

    fn select_handler(&self) -> Handler {
        if self.ops.session_type == SessionType::Rtp {
            return Handler::Rtp;
        }
        match self.detector.status {
            DetectStatus::Detecting => Handler::Detect,
            DetectStatus::Fail => Handler::DetectErr,
            DetectStatus::Success | DetectStatus::Disabled => {
                if self.ops.st22.is_some() {
                    Handler::St22
                } else if self.ops.flags.hdr_split {
                    Handler::HdrSplit
                } else {
                    Handler::Frame
                }
            }
        }
    }

    pub fn detach(&mut self) {
        self.attached = false;
        if let Some(core) = &self.core {
            if let Some(ebu) = &core.ebu {
                ebu.lock().final_summary(&self.ops.name);
            }
        }
        let now = self.deps.clock.now_ns();
        let elapsed = (now - self.stat_last_ns) as f64 / 1e9;
        self.stats.dump_and_reset(&self.ops.name, elapsed, self.cpu_busy_score, self.dma_busy_score);
        self.uninit_mcast();
        self.uninit_rtcp();
        self.uninit_sw();
        self.uninit_hw();
        info!("rx[{}]: detached", self.ops.name);
    }

    /// Swap the stream source online: tear down the network side, keep the
    /// software side, bring the network side back on the new addresses.
    pub fn update_source(&mut self, sources: Vec<crate::ops::PortSource>) -> Result<(), Error> {
        if sources.len() != self.ops.num_ports() {
            return Err(Error::InvalidOps("source count must match port count"));
        }
        self.uninit_rtcp();
        self.uninit_mcast();
        self.uninit_hw();

        self.ops.sources = sources;
        self.dst_ports = self
            .ops
            .sources
            .iter()
            .map(|s| if s.udp_port != 0 { s.udp_port } else { 10_000 + self.idx as u16 * 2 })
            .collect();

        self.init_hw()?;
        if let Err(e) = self.init_mcast() {
            self.uninit_hw();
            return Err(e);
        }
        if self.ops.flags.enable_rtcp {
            if let Err(e) = self.init_rtcp() {
                self.uninit_mcast();
                self.uninit_hw();
                return Err(e);
            }
        }
        info!("rx[{}]: source updated", self.ops.name);
        Ok(())
    }

    /// Packet-rx tasklet body. Returns true when any work was done.
    pub fn poll_rx(&mut self) -> bool {
        if !self.attached {
            return false;
        }
        let mut busy = false;

        if let Some(dma) = &mut self.dma {
            if let Some(core) = &self.core {
                handlers::dma_dequeue(core, dma);
                if !dma.lender.empty() {
                    busy = true;
                }
            }
            dma.copied = false;
        }

        let mut mbufs: Vec<Mbuf> = Vec::with_capacity(RX_BURST_SIZE);
        for port in 0..self.ops.num_ports() {
            mbufs.clear();
            let n = match &mut self.queues[port] {
                Some(q) => q.burst(&mut mbufs, RX_BURST_SIZE),
                None => 0,
            };
            if n > 0 {
                busy = true;
                bump(&self.stats.nic_inflight_cnt);
                self.handle_burst(port, &mbufs);
            }
            bump(&self.stats.nic_burst_cnt);
        }

        if let Some(dma) = &mut self.dma {
            if dma.copied {
                dma.lender.submit();
            }
        }
        busy
    }

    fn handle_burst(&mut self, port: usize, mbufs: &[Mbuf]) {
        // Co-thread hand-off first; whatever does not fit is handled inline
        // without slot ownership.
        let mut inline_from = 0;
        let co_present = self.co.is_some();
        if co_present {
            let co = self.co.as_mut().expect("checked");
            let mut pushed = 0;
            for m in mbufs {
                if co.prod.try_push(m.clone()).is_err() {
                    break;
                }
                pushed += 1;
            }
            if pushed < mbufs.len() {
                add(&self.stats.pkts_enqueue_fallback, (mbufs.len() - pushed) as u64);
            }
            inline_from = pushed;
            for m in &mbufs[..pushed] {
                add(&self.stats.bytes_received, m.len() as u64);
                bump(&self.port_stats[port].packets);
                add(&self.port_stats[port].bytes, m.len() as u64);
            }
            for m in &mbufs[..pushed] {
                self.observe_rtcp(port, m);
            }
        }

        for m in &mbufs[inline_from..] {
            if self.ops.flags.simulate_pkt_loss && self.sim_loss.drop_pkt() {
                bump(&self.stats.pkts_simulate_loss);
                continue;
            }
            self.observe_rtcp(port, m);
            let ctx = PktCtx { port, slot_owner: !co_present, co_thread: false };
            let res = self.dispatch(m, ctx);
            match res {
                Ok(()) => {
                    add(&self.stats.bytes_received, m.len() as u64);
                    bump(&self.port_stats[port].packets);
                    add(&self.port_stats[port].bytes, m.len() as u64);
                }
                Err(_) => {
                    bump(&self.port_stats[port].err_packets);
                }
            }
        }
    }

    fn observe_rtcp(&mut self, port: usize, m: &Mbuf) {
        if let Some(rtcp) = self.rtcp[port].as_mut() {
            if let Some(rtp) = RtpHeader::parse(&m.data) {
                rtcp.on_rtp_seq(rtp.sequence, m.rx_time_ns);
            }
        }
    }

    fn dispatch(&mut self, m: &Mbuf, ctx: PktCtx) -> Result<(), PktDropReason> {
        match self.handler {
            Handler::Detect => self.handle_detect_pkt(m),
            Handler::DetectErr => {
                if !self.detect_err_logged {
                    error!(
                        "rx[{}]: format detection failed, stream is being dropped",
                        self.ops.name
                    );
                    self.detect_err_logged = true;
                    self.ops.events.on_event(SessionEvent::DetectFailed);
                }
                Ok(())
            }
            Handler::Frame => {
                let core = self.core.clone().expect("sw initialized");
                handlers::handle_frame_pkt(&core, &mut self.dma, m, ctx)
            }
            Handler::St22 => {
                let core = self.core.clone().expect("sw initialized");
                handlers::handle_st22_pkt(&core, &mut self.dma, m, ctx)
            }
            Handler::HdrSplit => {
                let core = self.core.clone().expect("sw initialized");
                handlers::handle_hdr_split_pkt(&core, m, ctx)
            }
            Handler::Rtp => {
                let core = self.core.clone().expect("sw initialized");
                handlers::handle_rtp_pkt(&core, m, ctx)
            }
        }
    }

    fn handle_detect_pkt(&mut self, m: &Mbuf) -> Result<(), PktDropReason> {
        let pkt = match crate::rtp::Rfc4175Pkt::parse(&m.data) {
            Some(p) => p,
            None => {
                bump(&self.stats.pkts_wrong_hdr_dropped);
                return Err(PktDropReason::WrongHeader);
            }
        };
        if pkt.rtp.payload_type != self.ops.payload_type {
            bump(&self.stats.pkts_wrong_hdr_dropped);
            return Err(PktDropReason::WrongHeader);
        }
        self.detector.on_pkt(
            pkt.declared_len() as u32,
            pkt.extra_srd.is_some(),
            pkt.srd.second_field,
        );
        if pkt.rtp.marker {
            let total = self.stats.pkts_received.load(Ordering::Relaxed);
            let status = self.detector.on_marker(pkt.rtp.timestamp, total, pkt.srd.row);
            match status {
                DetectStatus::Success => self.finish_detection()?,
                DetectStatus::Fail => {
                    self.handler = Handler::DetectErr;
                }
                _ => {}
            }
        }
        bump(&self.stats.pkts_received);
        Ok(())
    }

    /// Detection succeeded: adopt the detected format, let the application
    /// adjust, then bring up the software side that was deferred.
    fn finish_detection(&mut self) -> Result<(), PktDropReason> {
        let meta = self.detector.meta;
        self.ops.width = meta.width;
        self.ops.height = meta.height;
        self.ops.fps = meta.fps.expect("detect success implies fps");
        self.ops.packing = meta.packing.expect("detect success implies packing");
        self.ops.interlaced = meta.interlaced;

        let reply = self.ops.events.on_detected(&meta);
        if reply.slice_lines != 0 {
            self.ops.slice_lines = reply.slice_lines;
        }
        if reply.uframe_size != 0 {
            self.ops.uframe_size = reply.uframe_size;
        }
        self.geo = None; // rederive from the adopted format

        match self.init_sw() {
            Ok(()) => {
                self.handler = self.select_handler();
                info!(
                    "rx[{}]: detected {}x{}@{:.2} {:?}{}, {} pkts/frame",
                    self.ops.name,
                    meta.width,
                    meta.height,
                    self.ops.fps.rate(),
                    self.ops.packing,
                    if meta.interlaced { " interlaced" } else { "" },
                    self.detector.pkt_per_frame
                );
                Ok(())
            }
            Err(e) => {
                error!("rx[{}]: post-detect init failed: {e}", self.ops.name);
                self.detector.status = DetectStatus::Fail;
                self.handler = Handler::DetectErr;
                Err(PktDropReason::NoSlot)
            }
        }
    }

    /// Control tasklet body: vsync, NACK emission, periodic stats.
    pub fn poll_control(&mut self) {
        if !self.attached {
            return;
        }
        let now = self.deps.clock.now_ns();

        if let Some(vsync) = &mut self.vsync {
            if now > vsync.next_epoch_ns {
                let late = now - vsync.next_epoch_ns;
                self.ops.events.on_event(SessionEvent::Vsync { epoch: vsync.epoch });
                vsync.advance(now);
                if late > 1_000_000 {
                    bump(&self.stats.vsync_mismatch);
                }
            }
        }

        if let Some(tx) = &self.nack_tx {
            for rtcp in self.rtcp.iter_mut().flatten() {
                rtcp.send_nacks(now, tx.as_ref());
            }
        }

        if now.saturating_sub(self.stat_last_ns) >= STAT_INTERVAL_NS {
            let elapsed = (now - self.stat_last_ns) as f64 / 1e9;
            self.recalc_busy_scores();
            self.stats.dump_and_reset(
                &self.ops.name,
                elapsed,
                self.cpu_busy_score,
                self.dma_busy_score,
            );
            self.stat_last_ns = now;
        }
    }

    /// CPU/DMA busy scores feeding session migration decisions.
    fn recalc_busy_scores(&mut self) {
        let bursts = self.stats.nic_burst_cnt.swap(0, Ordering::Relaxed);
        let inflight = self.stats.nic_inflight_cnt.swap(0, Ordering::Relaxed);
        let frame_slots = self.stats.cbs_frame_slot_cnt.swap(0, Ordering::Relaxed);
        let incomplete = self.stats.cbs_incomplete_frame_cnt.swap(0, Ordering::Relaxed);
        let dma_busy_cnt = self.stats.dma_previous_busy.swap(0, Ordering::Relaxed);

        let old_cpu = self.cpu_busy_score;
        let mut cpu = 0.0f32;
        if bursts > 0 {
            cpu = 100.0 * inflight as f32 / bursts as f32;
        }
        if frame_slots > 10 && incomplete > 10 {
            cpu = old_cpu + 40.0;
        }
        self.cpu_busy_score = cpu.min(100.0);

        if dma_busy_cnt > 0 {
            self.dma_busy_score = (self.dma_busy_score + 40.0).min(100.0);
        } else {
            self.dma_busy_score = 0.0;
        }
    }

    pub fn dequeue_rtp(&mut self) -> Option<Mbuf> {
        self.rtp_cons.as_mut()?.try_pop()
    }

    pub fn port_stats_snapshot(&self, port: usize) -> Option<crate::stats::PortStatsSnapshot> {
        if port >= self.ops.num_ports() {
            return None;
        }
        Some(self.port_stats[port].snapshot())
    }

    pub fn reset_port_stats(&self, port: usize) {
        if port < self.ops.num_ports() {
            self.port_stats[port].reset();
        }
    }

    pub fn num_ports(&self) -> usize {
        self.ops.num_ports()
    }

    pub fn framebuffer_size(&self) -> usize {
        self.geo.as_ref().map(|g| g.fb_size).unwrap_or(0)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.ops.framebuff_cnt
    }

    pub fn name(&self) -> &str {
        &self.ops.name
    }

    #[cfg(test)]
    pub(crate) fn stats_ref(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    #[cfg(test)]
    pub(crate) fn core_ref(&self) -> Option<&Arc<SessionCore>> {
        self.core.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn has_cothread(&self) -> bool {
        self.co.is_some()
    }

    #[cfg(test)]
    pub(crate) fn hdr_split_ref(&self) -> Option<&Arc<HdrSplitState>> {
        self.hdr_split.as_ref()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.attached {
            self.detach();
        } else if let Some(mut co) = self.co.take() {
            co.active.store(false, Ordering::Release);
            if let Some(h) = co.handle.take() {
                let _ = h.join();
            }
        }
    }
}

#[cfg(test)]
mod tests;
