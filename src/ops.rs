//! Session configuration and the application-facing callback surface.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::detector::DetectMeta;
use crate::fmt::{Fps, Packing, PixelFormat};
use crate::frame::{ExtFrame, FrameBuffer, FrameLease};
use crate::rtcp::{NackTx, RtcpOps};

/// Delivery granularity of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    /// Whole frames.
    Frame,
    /// Frames plus slice-ready notifications as lines accumulate.
    Slice,
    /// Raw RTP passthrough; the application reassembles.
    Rtp,
}

/// Feature switches, all off by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxFlags {
    /// Offload payload placement to a DMA lender when one is available.
    pub dma_offload: bool,
    /// Infer format from the stream before going live.
    pub auto_detect: bool,
    /// Surface corrupted frames to the application instead of recycling
    /// them silently.
    pub receive_incomplete_frame: bool,
    pub enable_rtcp: bool,
    pub enable_vsync: bool,
    /// NIC header-split receive into the pre-mapped payload region.
    pub hdr_split: bool,
    /// Test aid: randomly drop bursts of received packets.
    pub simulate_pkt_loss: bool,
    /// Run the EBU/SMPTE timing compliance analyzer.
    pub timing_analysis: bool,
}

/// One source leg of the session.
#[derive(Debug, Clone, Copy)]
pub struct PortSource {
    pub ip: Ipv4Addr,
    /// Zero picks the conventional `10000 + 2 * session_index`.
    pub udp_port: u16,
}

/// ST 2110-22 specific knobs.
#[derive(Debug, Clone, Copy)]
pub struct St22Ops {
    /// Upper bound of one compressed frame; sizes the framebuffers.
    pub framebuff_max_size: usize,
    /// Skip jpvs/colr box parsing on the first packet.
    pub disable_boxes: bool,
}

/// Final disposition of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    /// Complete, but the redundant port contributed more than trivially.
    Reconstructed,
    Corrupted,
}

/// Frame-ready metadata.
#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub fmt: PixelFormat,
    pub fps: Fps,
    /// RTP timestamp of the frame.
    pub timestamp: u32,
    /// Arrival time of the first packet, session clock.
    pub timestamp_first_pkt_ns: u64,
    /// Arrival time of the closing packet, session clock.
    pub timestamp_last_pkt_ns: u64,
    /// First-packet time relative to the frame epoch, ns.
    pub fpt_ns: f64,
    pub second_field: bool,
    pub frame_total_size: u64,
    pub uframe_total_size: u64,
    pub frame_recv_size: u64,
    pub user_meta_size: usize,
    pub status: FrameStatus,
    /// Cookie from a dynamic external frame binding.
    pub opaque: u64,
}

/// Slice-ready metadata.
#[derive(Debug, Clone, Copy)]
pub struct SliceMeta {
    pub timestamp: u32,
    pub second_field: bool,
    pub frame_recv_size: u64,
    /// Contiguously received lines from the top of the frame.
    pub frame_recv_lines: u32,
}

/// Per-packet pixel-group metadata for user-frame mode.
#[derive(Debug, Clone, Copy)]
pub struct UframePgMeta {
    pub row_length: u16,
    pub row_number: u16,
    pub row_offset: u16,
    pub pg_cnt: u32,
    pub timestamp: u32,
}

/// Reply from the detection callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectReply {
    /// Slice granularity override; zero keeps `height / 32`.
    pub slice_lines: u32,
    /// Switch the session to user-frame mode with this size.
    pub uframe_size: u64,
}

/// Out-of-band session events.
#[derive(Debug, Clone, Copy)]
pub enum SessionEvent {
    /// Start of a new frame epoch on the media clock.
    Vsync { epoch: u64 },
    /// The format detector gave up; packets are being dropped.
    DetectFailed,
}

/// Application callbacks. All have no-op defaults except frame delivery,
/// which is the whole point of a session.
pub trait SessionEvents: Send + Sync {
    /// A frame closed. Hold the lease as long as the pixels are needed;
    /// dropping it hands the buffer back to the pool.
    fn on_frame_ready(&self, frame: FrameLease, meta: &FrameMeta);

    fn on_slice_ready(&self, _frame: &FrameBuffer, _meta: &SliceMeta) {}

    /// RTP passthrough: a packet is waiting in the ring.
    fn on_rtp_ready(&self) {}

    /// Detection concluded; the reply can reshape slice/user-frame setup.
    fn on_detected(&self, _meta: &DetectMeta) -> DetectReply {
        DetectReply::default()
    }

    /// Dynamic external frame mode: bind memory for the frame about to
    /// start. `None` drops the frame on the floor.
    fn query_ext_frame(&self, _meta: &FrameMeta) -> Option<ExtFrame> {
        None
    }

    /// User-frame mode: place this packet's pixel groups yourself.
    fn on_uframe_pg(&self, _frame: &FrameBuffer, _meta: &UframePgMeta, _payload: &[u8]) {}

    fn on_event(&self, _event: SessionEvent) {}
}

/// Session configuration. `RxOps::new` fills workable defaults; set what
/// the stream needs on top.
#[derive(Clone)]
pub struct RxOps {
    pub name: String,
    pub sources: Vec<PortSource>,
    pub session_type: SessionType,
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub fmt: PixelFormat,
    pub interlaced: bool,
    pub packing: Packing,
    pub payload_type: u8,
    /// Application line stride; zero means tight lines.
    pub linesize: usize,
    pub framebuff_cnt: usize,
    /// Non-zero switches on user-frame mode.
    pub uframe_size: u64,
    /// Lines per slice in slice mode; zero means `height / 32`.
    pub slice_lines: u32,
    /// RTP passthrough ring capacity.
    pub rtp_ring_size: usize,
    pub flags: RxFlags,
    pub rtcp: RtcpOps,
    /// Feedback transmitter; when unset a UDP socket on `dst_port + 1` is
    /// opened at attach.
    pub nack_tx: Option<Arc<dyn NackTx>>,
    pub st22: Option<St22Ops>,
    /// Static external framebuffers, one per `framebuff_cnt`.
    pub ext_frames: Option<Vec<ExtFrame>>,
    /// Resolve frame memory per frame via `query_ext_frame`.
    pub dynamic_ext_frame: bool,
    /// Simulated loss: longest drop burst.
    pub burst_loss_max: u32,
    /// Simulated loss: per-packet burst start probability.
    pub sim_loss_rate: f32,
    pub events: Arc<dyn SessionEvents>,
}

impl RxOps {
    pub fn new(name: &str, sources: Vec<PortSource>, events: Arc<dyn SessionEvents>) -> Self {
        Self {
            name: name.to_string(),
            sources,
            session_type: SessionType::Frame,
            width: 1920,
            height: 1080,
            fps: Fps::P59_94,
            fmt: PixelFormat::Yuv422p10,
            interlaced: false,
            packing: Packing::Bpm,
            payload_type: 96,
            linesize: 0,
            framebuff_cnt: 3,
            uframe_size: 0,
            slice_lines: 0,
            rtp_ring_size: 1024,
            flags: RxFlags::default(),
            rtcp: RtcpOps::default(),
            nack_tx: None,
            st22: None,
            ext_frames: None,
            dynamic_ext_frame: false,
            burst_loss_max: 0,
            sim_loss_rate: 0.0,
            events,
        }
    }

    pub fn num_ports(&self) -> usize {
        self.sources.len()
    }
}
