//! Session-level tests driving whole packet flows through the in-memory
//! queue backend. The default geometry is a deliberately small 64x16
//! YCbCr-4:2:2-10 stream: one 160-byte packet per line, 16 packets and
//! 2560 bytes per frame, which keeps whole-frame scenarios readable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::handlers;
use super::*;
use crate::clock::test::TestClock;
use crate::detector::DetectMeta;
use crate::dma::SoftDmaProvider;
use crate::fmt::Fps;
use crate::frame::FrameLease;
use crate::ops::{DetectReply, FrameMeta, FrameStatus, PortSource, SliceMeta, UframePgMeta};
use crate::queue::test::TestQueueBackend;
use crate::rtcp::NackTx;
use crate::rtp::{build_rfc4175, RtpHeader, Srd};

const TEST_PT: u8 = 96;
const LINE_BYTES: usize = 160; // 64 px * 5 / 2

#[derive(Default)]
struct Collect {
    frames: Mutex<Vec<(FrameStatus, u64, u32, usize, Vec<u8>)>>,
    slices: Mutex<Vec<SliceMeta>>,
    rtp_ready: AtomicU64,
    uframe_pgs: AtomicU64,
    detected: Mutex<Option<DetectMeta>>,
    events: Mutex<Vec<String>>,
}

impl SessionEvents for Collect {
    fn on_frame_ready(&self, frame: FrameLease, meta: &FrameMeta) {
        self.frames.lock().push((
            meta.status,
            meta.frame_recv_size,
            meta.timestamp,
            meta.user_meta_size,
            frame.bytes().to_vec(),
        ));
    }

    fn on_slice_ready(&self, _frame: &crate::frame::FrameBuffer, meta: &SliceMeta) {
        self.slices.lock().push(*meta);
    }

    fn on_rtp_ready(&self) {
        self.rtp_ready.fetch_add(1, Ordering::Relaxed);
    }

    fn on_detected(&self, meta: &DetectMeta) -> DetectReply {
        *self.detected.lock() = Some(*meta);
        DetectReply::default()
    }

    fn on_uframe_pg(&self, _frame: &crate::frame::FrameBuffer, _meta: &UframePgMeta, _p: &[u8]) {
        self.uframe_pgs.fetch_add(1, Ordering::Relaxed);
    }

    fn on_event(&self, event: SessionEvent) {
        self.events.lock().push(format!("{event:?}"));
    }
}

struct Ctx {
    session: Session,
    backend: Arc<TestQueueBackend>,
    clock: Arc<TestClock>,
    events: Arc<Collect>,
}

fn make(configure: impl FnOnce(&mut RxOps)) -> Ctx {
    make_with_deps(configure, None, None)
}

fn make_with_deps(
    configure: impl FnOnce(&mut RxOps),
    dma: Option<Arc<SoftDmaProvider>>,
    dma_page_size: Option<usize>,
) -> Ctx {
    let clock = TestClock::new(1_000_000_000);
    let backend = TestQueueBackend::new(2);
    let events = Arc::new(Collect::default());
    let sources = vec![
        PortSource { ip: "239.0.0.1".parse().unwrap(), udp_port: 20000 },
        PortSource { ip: "239.0.0.2".parse().unwrap(), udp_port: 20000 },
    ];
    let mut ops = RxOps::new("t", sources, events.clone());
    ops.width = 64;
    ops.height = 16;
    ops.fps = Fps::P60;
    ops.payload_type = TEST_PT;
    ops.sources.truncate(1);
    configure(&mut ops);
    let deps = SessionDeps {
        backend: backend.clone(),
        dma: dma.map(|d| d as Arc<dyn crate::dma::DmaProvider>),
        clock: clock.clone(),
        dma_page_size,
    };
    let session = Session::attach(0, ops, deps).expect("attach");
    Ctx { session, backend, clock, events }
}

fn line_pkt(seq32: u32, ts: u32, row: u16, fill: u8, marker: bool) -> Bytes {
    let rtp = RtpHeader {
        padding: false,
        extension: false,
        csrc_count: 0,
        marker,
        payload_type: TEST_PT,
        sequence: seq32 as u16,
        timestamp: ts,
        ssrc: 0x10,
    };
    let srd = Srd {
        length: LINE_BYTES as u16,
        row,
        offset: 0,
        second_field: false,
        user_meta: false,
        continuation: false,
    };
    build_rfc4175(&rtp, (seq32 >> 16) as u16, &srd, None, &vec![fill; LINE_BYTES])
}

/// Feed one 16-line frame on `port`, skipping the rows in `drop`.
fn feed_frame(ctx: &Ctx, port: usize, base_seq: u32, ts: u32, rows: u16, drop: &[u16]) {
    for row in 0..rows {
        if drop.contains(&row) {
            continue;
        }
        let pkt = line_pkt(base_seq + row as u32, ts, row, row as u8 + 1, row == rows - 1);
        ctx.backend.feed(port, Mbuf::new(pkt, ctx.clock.now_ns()));
        ctx.clock.advance(10_000);
    }
}

fn drain(ctx: &mut Ctx) {
    for _ in 0..1000 {
        let busy = ctx.session.poll_rx();
        if !busy && ctx.backend.pending(0) == 0 && ctx.backend.pending(1) == 0 {
            break;
        }
    }
}

#[test]
fn complete_frame_single_port() {
    let mut ctx = make(|_| {});
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[]);
    // completion happens on the last payload byte, no flush needed
    drain(&mut ctx);

    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    let (status, recv, ts, _, data) = &frames[0];
    assert_eq!(*status, FrameStatus::Complete);
    assert_eq!(*recv, 2560);
    assert_eq!(*ts, 90_000);
    // every line carries its row number + 1
    for row in 0..16usize {
        assert!(data[row * LINE_BYTES..(row + 1) * LINE_BYTES]
            .iter()
            .all(|b| *b == row as u8 + 1));
    }
    drop(frames);

    let stats = ctx.session.stats_ref();
    assert_eq!(stats.pkts_received.load(Ordering::Relaxed), 16);
    assert_eq!(stats.pkts_redundant_dropped.load(Ordering::Relaxed), 0);
    assert_eq!(stats.frames_received.load(Ordering::Relaxed), 1);
}

#[test]
fn back_to_back_frames() {
    let mut ctx = make(|_| {});
    for f in 0..5u32 {
        feed_frame(&ctx, 0, 1000 + f * 16, 90_000 + f * 1500, 16, &[]);
    }
    drain(&mut ctx);
    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 5);
    assert!(frames.iter().all(|f| f.0 == FrameStatus::Complete));
    // timestamps in arrival order
    assert_eq!(frames[4].2, 90_000 + 4 * 1500);
}

#[test]
fn loss_covered_by_redundant_port_stays_complete() {
    let mut ctx = make(|ops| {
        ops.sources.push(PortSource { ip: "239.0.0.2".parse().unwrap(), udp_port: 20000 });
    });
    // primary loses its closing packet, the redundant port carries everything
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[15]);
    feed_frame(&ctx, 1, 1000, 90_000, 16, &[]);
    drain(&mut ctx);

    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    // one packet from the secondary path is well under the reconstruction
    // threshold
    assert_eq!(frames[0].0, FrameStatus::Complete);
    // the gap line was filled from port 1
    assert!(frames[0].4[15 * LINE_BYTES..16 * LINE_BYTES].iter().all(|b| *b == 16));
    drop(frames);
    let stats = ctx.session.stats_ref();
    assert_eq!(stats.pkts_received.load(Ordering::Relaxed), 16);
    assert_eq!(stats.pkts_redundant_dropped.load(Ordering::Relaxed), 15);
}

#[test]
fn heavy_primary_loss_marks_reconstructed() {
    let mut ctx = make(|ops| {
        ops.height = 48;
        ops.sources.push(PortSource { ip: "239.0.0.2".parse().unwrap(), udp_port: 20000 });
    });
    let dropped: Vec<u16> = (0..20).map(|i| i * 2).collect();
    feed_frame(&ctx, 0, 1000, 90_000, 48, &dropped);
    feed_frame(&ctx, 1, 1000, 90_000, 48, &[]);
    drain(&mut ctx);

    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    // 20 of 48 packets came only from the redundant port
    assert_eq!(frames[0].0, FrameStatus::Reconstructed);
}

#[test]
fn full_duplicate_yields_one_notification() {
    let mut ctx = make(|ops| {
        ops.sources.push(PortSource { ip: "239.0.0.2".parse().unwrap(), udp_port: 20000 });
    });
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[]);
    feed_frame(&ctx, 1, 1000, 90_000, 16, &[]);
    drain(&mut ctx);

    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, FrameStatus::Complete);
    drop(frames);
    // the frame closed on the primary's last packet; the full replay finds
    // the slot already flushed and is absorbed without a second delivery
    let stats = ctx.session.stats_ref();
    assert_eq!(stats.pkts_no_slot.load(Ordering::Relaxed), 16);
    assert_eq!(stats.frames_received.load(Ordering::Relaxed), 1);
}

#[test]
fn bitmap_popcount_matches_unique_receives() {
    let mut ctx = make(|_| {});
    // partial frame with one duplicate, left open
    for row in [0u16, 1, 2, 2, 7] {
        let pkt = line_pkt(1000 + row as u32, 90_000, row, 1, false);
        ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    }
    drain(&mut ctx);
    let core = ctx.session.core_ref().unwrap();
    let slot = &core.slots[core.slot_rr.load(Ordering::Relaxed)];
    let received = slot.pkts_received.load(Ordering::Relaxed);
    let redundant = slot.pkts_redundant.load(Ordering::Relaxed);
    assert_eq!(received, 4);
    assert_eq!(redundant, 1);
    assert_eq!(slot.bitmap.popcount(), received);
    assert!(slot.frame_recv_size() <= core.geo.frame_size);
}

#[test]
fn corrupted_frame_recycled_silently_by_default() {
    let mut ctx = make(|_| {});
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[3]);
    // next frame evicts the incomplete one
    feed_frame(&ctx, 0, 1016, 91_500, 16, &[]);
    drain(&mut ctx);

    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, FrameStatus::Complete);
    drop(frames);
    let stats = ctx.session.stats_ref();
    assert_eq!(stats.frames_dropped.load(Ordering::Relaxed), 1);
    assert_eq!(stats.frames_pkts_missed.load(Ordering::Relaxed), 1);
}

#[test]
fn corrupted_frame_surfaced_when_requested() {
    let mut ctx = make(|ops| {
        ops.flags.receive_incomplete_frame = true;
    });
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[3, 4]);
    feed_frame(&ctx, 0, 1016, 91_500, 16, &[]);
    drain(&mut ctx);

    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].0, FrameStatus::Corrupted);
    assert_eq!(frames[0].1, 2560 - 2 * LINE_BYTES as u64);
    assert_eq!(frames[1].0, FrameStatus::Complete);
}

#[test]
fn user_meta_side_channel() {
    let mut ctx = make(|_| {});
    // metadata packet first, then the pixel packets
    let rtp = RtpHeader {
        padding: false,
        extension: false,
        csrc_count: 0,
        marker: false,
        payload_type: TEST_PT,
        sequence: 999,
        timestamp: 90_000,
        ssrc: 0x10,
    };
    let srd = Srd {
        length: 200,
        row: 0,
        offset: 0,
        second_field: false,
        user_meta: true,
        continuation: false,
    };
    let meta_pkt = build_rfc4175(&rtp, 0, &srd, None, &[0xAAu8; 200]);
    ctx.backend.feed(0, Mbuf::new(meta_pkt, ctx.clock.now_ns()));
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[]);
    drain(&mut ctx);

    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, FrameStatus::Complete);
    assert_eq!(frames[0].3, 200);
    drop(frames);
    let stats = ctx.session.stats_ref();
    // the side channel does not count as pixel packets
    assert_eq!(stats.pkts_received.load(Ordering::Relaxed), 16);
    assert_eq!(stats.pkts_user_meta.load(Ordering::Relaxed), 1);
}

#[test]
fn oversized_user_meta_is_rejected() {
    let mut ctx = make(|_| {});
    let rtp = RtpHeader {
        padding: false,
        extension: false,
        csrc_count: 0,
        marker: false,
        payload_type: TEST_PT,
        sequence: 999,
        timestamp: 90_000,
        ssrc: 0x10,
    };
    // declared meta length larger than the per-frame buffer
    let srd = Srd {
        length: 2000,
        row: 0,
        offset: 0,
        second_field: false,
        user_meta: true,
        continuation: false,
    };
    let pkt = build_rfc4175(&rtp, 0, &srd, None, &[0u8; 2000]);
    ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[]);
    drain(&mut ctx);
    let stats = ctx.session.stats_ref();
    assert_eq!(stats.pkts_user_meta_err.load(Ordering::Relaxed), 1);
    assert_eq!(ctx.events.frames.lock()[0].3, 0);
}

#[test]
fn wrong_payload_type_counted_and_dropped() {
    let mut ctx = make(|_| {});
    let rtp = RtpHeader {
        padding: false,
        extension: false,
        csrc_count: 0,
        marker: false,
        payload_type: 97,
        sequence: 0,
        timestamp: 90_000,
        ssrc: 0,
    };
    let srd = Srd {
        length: LINE_BYTES as u16,
        row: 0,
        offset: 0,
        second_field: false,
        user_meta: false,
        continuation: false,
    };
    let pkt = build_rfc4175(&rtp, 0, &srd, None, &[0u8; LINE_BYTES]);
    ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    drain(&mut ctx);
    let stats = ctx.session.stats_ref();
    assert_eq!(stats.pkts_wrong_hdr_dropped.load(Ordering::Relaxed), 1);
    assert_eq!(stats.pkts_received.load(Ordering::Relaxed), 0);
    assert_eq!(ctx.session.port_stats_snapshot(0).unwrap().err_packets, 1);
}

#[test]
fn offset_past_frame_allowance_dropped() {
    let mut ctx = make(|_| {});
    let pkt = line_pkt(1000, 90_000, 40, 1, false); // row 40 of a 16-line frame
    ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    drain(&mut ctx);
    assert_eq!(ctx.session.stats_ref().pkts_offset_dropped.load(Ordering::Relaxed), 1);
}

#[test]
fn out_of_window_sequence_dropped() {
    let mut ctx = make(|_| {});
    feed_frame(&ctx, 0, 1000, 90_000, 4, &[]); // partial, base anchored at 1000
    // same timestamp, sequence far beyond the bitmap
    let pkt = line_pkt(1000 + 1_000_000, 90_000, 5, 1, false);
    ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    drain(&mut ctx);
    assert_eq!(ctx.session.stats_ref().pkts_idx_oo_bitmap.load(Ordering::Relaxed), 1);
}

#[test]
fn non_owner_cannot_capture_base() {
    let ctx = make(|_| {});
    let core = ctx.session.core_ref().unwrap().clone();
    let mut no_dma = None;
    let pkt = Mbuf::new(line_pkt(500, 90_000, 1, 9, false), 0);

    let fallback = PktCtx { port: 0, slot_owner: false, co_thread: false };
    // no slot exists yet and a non-owner may not open one
    assert!(handlers::handle_frame_pkt(&core, &mut no_dma, &pkt, fallback).is_err());
    assert_eq!(core.stats.pkts_no_slot.load(Ordering::Relaxed), 1);

    let owner = PktCtx { port: 0, slot_owner: true, co_thread: false };
    let first = Mbuf::new(line_pkt(499, 90_000, 0, 9, false), 0);
    handlers::handle_frame_pkt(&core, &mut no_dma, &first, owner).unwrap();

    // with the slot open and the base captured, the fallback path works and
    // accounts into its own counter
    let co = PktCtx { port: 0, slot_owner: true, co_thread: true };
    handlers::handle_frame_pkt(&core, &mut no_dma, &pkt, co).unwrap();
    let slot = &core.slots[core.slot_rr.load(Ordering::Relaxed)];
    assert_eq!(slot.recv_size.load(Ordering::Relaxed), LINE_BYTES as u64);
    assert_eq!(slot.co_recv_size.load(Ordering::Relaxed), LINE_BYTES as u64);
    assert_eq!(slot.frame_recv_size(), 2 * LINE_BYTES as u64);
    assert_eq!(slot.bitmap.popcount(), slot.pkts_received.load(Ordering::Relaxed));
}

#[test]
fn detect_720p_5994_and_switch_to_frame_handler() {
    let mut ctx = make(|ops| {
        ops.flags.auto_detect = true;
        // dimensions deliberately unset; the stream tells us
        ops.width = 0;
        ops.height = 0;
    });
    // four frames of block-packed packets; the fourth marker resolves
    let steps = [1501u32, 1502, 1501, 1501];
    let mut ts = 90_000u32;
    let mut seq = 2000u32;
    for step in steps {
        for i in 0..10u32 {
            let rtp = RtpHeader {
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: i == 9,
                payload_type: TEST_PT,
                sequence: seq as u16,
                timestamp: ts,
                ssrc: 0x20,
            };
            let srd = Srd {
                length: 1200,
                row: if i == 9 { 719 } else { 70 * i as u16 },
                offset: 0,
                second_field: false,
                user_meta: false,
                continuation: false,
            };
            let pkt = build_rfc4175(&rtp, (seq >> 16) as u16, &srd, None, &[7u8; 1200]);
            ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
            seq += 1;
        }
        ts = ts.wrapping_add(step);
    }
    drain(&mut ctx);

    let detected = ctx.events.detected.lock().clone().expect("detection concluded");
    assert_eq!((detected.width, detected.height), (1280, 720));
    assert_eq!(detected.fps, Some(Fps::P59_94));
    assert_eq!(detected.packing, Some(crate::fmt::Packing::Bpm));
    assert!(!detected.interlaced);

    // the session is live now: a full 720p frame comes through
    assert_eq!(ctx.session.framebuffer_size(), 1280 * 720 * 5 / 2);
    let line = 1280 * 5 / 2; // 3200 bytes
    for row in 0..720u32 {
        let rtp = RtpHeader {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: row == 719,
            payload_type: TEST_PT,
            sequence: (seq + row) as u16,
            timestamp: 200_000,
            ssrc: 0x20,
        };
        let srd = Srd {
            length: line as u16,
            row: row as u16,
            offset: 0,
            second_field: false,
            user_meta: false,
            continuation: false,
        };
        let pkt = build_rfc4175(&rtp, ((seq + row) >> 16) as u16, &srd, None, &vec![3u8; line]);
        ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    }
    drain(&mut ctx);
    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, FrameStatus::Complete);
    assert_eq!(frames[0].1, 1280 * 720 * 5 / 2);
}

#[test]
fn timing_analysis_goes_through_detection() {
    let mut ctx = make(|ops| {
        ops.flags.timing_analysis = true;
        ops.width = 0;
        ops.height = 0;
    });
    let mut ts = 90_000u32;
    let mut seq = 100u32;
    for _ in 0..4 {
        for i in 0..10u32 {
            let rtp = RtpHeader {
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: i == 9,
                payload_type: TEST_PT,
                sequence: seq as u16,
                timestamp: ts,
                ssrc: 0,
            };
            let srd = Srd {
                length: 1200,
                row: if i == 9 { 719 } else { i as u16 },
                offset: 0,
                second_field: false,
                user_meta: false,
                continuation: false,
            };
            ctx.backend.feed(
                0,
                Mbuf::new(build_rfc4175(&rtp, 0, &srd, None, &[0u8; 1200]), ctx.clock.now_ns()),
            );
            seq += 1;
        }
        ts += 1500;
    }
    drain(&mut ctx);
    // detector fed the analyzer its packets-per-frame figure
    let core = ctx.session.core_ref().expect("sw initialized after detect");
    assert!(core.ebu.is_some());
}

#[test]
fn detect_failure_is_terminal_and_quiet() {
    let mut ctx = make(|ops| {
        ops.flags.auto_detect = true;
    });
    let mut ts = 90_000u32;
    for f in 0..4u32 {
        for i in 0..4u32 {
            let rtp = RtpHeader {
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: i == 3,
                payload_type: TEST_PT,
                sequence: (f * 4 + i) as u16,
                timestamp: ts,
                ssrc: 0,
            };
            // max line 333 maps to no known raster
            let srd = Srd {
                length: 1200,
                row: 333,
                offset: 0,
                second_field: false,
                user_meta: false,
                continuation: false,
            };
            ctx.backend.feed(
                0,
                Mbuf::new(build_rfc4175(&rtp, 0, &srd, None, &[0u8; 1200]), ctx.clock.now_ns()),
            );
        }
        ts += 1500;
    }
    // more traffic after the failure: dropped without error storms
    for row in 0..4u16 {
        ctx.backend.feed(0, Mbuf::new(line_pkt(900 + row as u32, 500_000, row, 1, false), 0));
    }
    drain(&mut ctx);
    assert!(ctx.events.frames.lock().is_empty());
    let events = ctx.events.events.lock();
    assert_eq!(events.iter().filter(|e| e.contains("DetectFailed")).count(), 1);
}

#[test]
fn st22_boxes_and_marker_size() {
    let mut ctx = make(|ops| {
        ops.st22 = Some(crate::ops::St22Ops { framebuff_max_size: 65536, disable_boxes: false });
    });
    let mk = |seq: u16, idx: u32, marker: bool, payload: &[u8]| {
        let rtp = RtpHeader {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker,
            payload_type: TEST_PT,
            sequence: seq,
            timestamp: 90_000,
            ssrc: 0x22,
        };
        Mbuf::new(crate::rtp::build_rfc9134(&rtp, false, false, idx, payload), 0)
    };

    // first packet: jpvs(16) || colr(20) || codestream
    let mut p0 = Vec::new();
    p0.extend_from_slice(&16u32.to_be_bytes());
    p0.extend_from_slice(b"jpvs");
    p0.extend_from_slice(&[0u8; 8]);
    p0.extend_from_slice(&20u32.to_be_bytes());
    p0.extend_from_slice(b"colr");
    p0.extend_from_slice(&[0u8; 12]);
    p0.extend_from_slice(&vec![0xC0u8; 1164]);
    assert_eq!(p0.len(), 1200);

    ctx.backend.feed(0, mk(50, 0, false, &p0));
    ctx.backend.feed(0, mk(51, 1, false, &[0xC1u8; 1200]));
    ctx.backend.feed(0, mk(52, 2, true, &[0xC2u8; 300]));
    drain(&mut ctx);

    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    let (status, recv, _, _, data) = &frames[0];
    assert_eq!(*status, FrameStatus::Complete);
    // marker offset 2400 + len 300 - 36 bytes of boxes
    assert_eq!(*recv, 2664);
    assert!(data[..1164].iter().all(|b| *b == 0xC0));
    assert!(data[1164..2364].iter().all(|b| *b == 0xC1));
    assert!(data[2364..2664].iter().all(|b| *b == 0xC2));
}

#[test]
fn st22_out_of_order_completion_waits_for_marker_size() {
    let mut ctx = make(|ops| {
        ops.st22 = Some(crate::ops::St22Ops { framebuff_max_size: 65536, disable_boxes: true });
    });
    let mk = |seq: u16, idx: u32, marker: bool, payload: &[u8]| {
        let rtp = RtpHeader {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker,
            payload_type: TEST_PT,
            sequence: seq,
            timestamp: 90_000,
            ssrc: 0x22,
        };
        Mbuf::new(crate::rtp::build_rfc9134(&rtp, false, false, idx, payload), 0)
    };
    // marker first: frame must not complete until the gap fills
    ctx.backend.feed(0, mk(10, 0, false, &[1u8; 1000]));
    ctx.backend.feed(0, mk(12, 2, true, &[3u8; 500]));
    drain(&mut ctx);
    assert!(ctx.events.frames.lock().is_empty());
    ctx.backend.feed(0, mk(11, 1, false, &[2u8; 1000]));
    drain(&mut ctx);
    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, 2500);
}

#[test]
fn dma_backpressure_blocks_next_frame() {
    let provider = SoftDmaProvider::new();
    let mut ctx = make_with_deps(
        |ops| {
            ops.flags.dma_offload = true;
        },
        Some(provider.clone()),
        None,
    );
    provider.set_hold(true);
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[]);
    drain(&mut ctx);
    // all payload is still in flight; frame must not be announced
    assert!(ctx.events.frames.lock().is_empty());
    assert_eq!(ctx.session.stats_ref().pkts_dma.load(Ordering::Relaxed), 16);

    // a new frame cannot open a slot while descriptors are pending
    feed_frame(&ctx, 0, 1016, 91_500, 16, &[]);
    drain(&mut ctx);
    let stats = ctx.session.stats_ref();
    assert!(stats.dma_previous_busy.load(Ordering::Relaxed) > 0);
    assert!(stats.pkts_no_slot.load(Ordering::Relaxed) > 0);
    assert!(ctx.events.frames.lock().is_empty());

    // drain completions: the held frame closes with its payload in place
    provider.set_hold(false);
    ctx.session.poll_rx();
    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, FrameStatus::Complete);
    assert!(frames[0].4[..LINE_BYTES].iter().all(|b| *b == 1));
}

#[test]
fn dma_refuses_page_crossing_ranges() {
    let provider = SoftDmaProvider::new();
    let mut ctx = make_with_deps(
        |ops| {
            ops.flags.dma_offload = true;
        },
        Some(provider.clone()),
        Some(256),
    );
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[]);
    drain(&mut ctx);
    // several line destinations straddle the 256-byte pages and fall back
    // to the cpu, the frame still completes
    let dma_pkts = ctx.session.stats_ref().pkts_dma.load(Ordering::Relaxed);
    assert!(dma_pkts > 0 && dma_pkts < 16, "dma pkts {dma_pkts}");
    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, FrameStatus::Complete);
    for row in 0..16usize {
        assert!(frames[0].4[row * LINE_BYTES..(row + 1) * LINE_BYTES]
            .iter()
            .all(|b| *b == row as u8 + 1));
    }
}

#[test]
fn slice_mode_reports_contiguous_lines() {
    let mut ctx = make(|ops| {
        ops.session_type = SessionType::Slice;
        ops.flags.receive_incomplete_frame = true;
        ops.slice_lines = 2;
    });
    // out-of-order start: line 1 parks, line 0 merges it back
    let order: Vec<u16> = [1u16, 0].iter().copied().chain(2..16).collect();
    for row in order {
        let pkt = line_pkt(1000 + row as u32, 90_000, row, row as u8 + 1, row == 15);
        ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    }
    drain(&mut ctx);

    let slices = ctx.events.slices.lock();
    // 16 lines / 2 per slice: eight boundaries crossed
    assert_eq!(slices.len(), 8);
    assert_eq!(slices.last().unwrap().frame_recv_lines, 16);
    drop(slices);
    assert_eq!(ctx.session.stats_ref().pkts_slice_merged.load(Ordering::Relaxed), 1);
    assert_eq!(ctx.events.frames.lock().len(), 1);
}

#[test]
fn user_frame_mode_delegates_placement() {
    let mut ctx = make(|ops| {
        ops.uframe_size = 4096;
    });
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[]);
    drain(&mut ctx);
    assert_eq!(ctx.events.uframe_pgs.load(Ordering::Relaxed), 16);
    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    // nothing wrote into the library-owned buffer
    assert!(frames[0].4.iter().all(|b| *b == 0));
}

#[test]
fn rtp_passthrough_ring_and_backpressure() {
    let mut ctx = make(|ops| {
        ops.session_type = SessionType::Rtp;
        ops.rtp_ring_size = 8;
    });
    for i in 0..12u32 {
        let pkt = line_pkt(3000 + i, 90_000, i as u16, 1, false);
        ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    }
    drain(&mut ctx);

    let stats = ctx.session.stats_ref();
    assert_eq!(stats.pkts_rtp_ring_full.load(Ordering::Relaxed), 4);
    assert_eq!(ctx.events.rtp_ready.load(Ordering::Relaxed), 8);
    let mut got = 0;
    while let Some(m) = ctx.session.dequeue_rtp() {
        assert!(RtpHeader::parse(&m.data).is_some());
        got += 1;
    }
    assert_eq!(got, 8);
}

#[test]
fn hdr_split_receive_in_place() {
    let mut ctx = make(|ops| {
        ops.width = 480; // one 1200-byte buffer per line
        ops.height = 4;
        ops.sources.truncate(1);
        ops.flags.hdr_split = true;
    });
    // warm the region allocator the way NIC descriptor prefill would
    use crate::queue::PayloadSlotAlloc;
    let hs = ctx.session.hdr_split_ref().unwrap().clone();
    for _ in 0..hs.mbufs_total() {
        hs.next_payload_slot();
    }
    assert!(hs.pool_ready());

    for row in 0..4u16 {
        let rtp = RtpHeader {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: row == 3,
            payload_type: TEST_PT,
            sequence: 600 + row,
            timestamp: 90_000,
            ssrc: 0,
        };
        let srd = Srd {
            length: 1200,
            row,
            offset: 0,
            second_field: false,
            user_meta: false,
            continuation: false,
        };
        let headers = build_rfc4175(&rtp, 0, &srd, None, &[]);
        ctx.backend.feed_split(0, headers, &[row as u8 + 1; 1200], ctx.clock.now_ns());
    }
    drain(&mut ctx);

    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, FrameStatus::Complete);
    for row in 0..4usize {
        assert!(frames[0].4[row * 1200..(row + 1) * 1200].iter().all(|b| *b == row as u8 + 1));
    }
    drop(frames);
    let stats = ctx.session.stats_ref();
    assert_eq!(stats.pkts_copy_hdr_split.load(Ordering::Relaxed), 0);
    assert_eq!(stats.pkts_wrong_payload_hdr_split.load(Ordering::Relaxed), 0);
}

#[test]
fn simulated_loss_drops_bursts() {
    let mut ctx = make(|ops| {
        ops.flags.simulate_pkt_loss = true;
        ops.sim_loss_rate = 0.3;
        ops.burst_loss_max = 2;
    });
    for f in 0..20u32 {
        feed_frame(&ctx, 0, 1000 + f * 16, 90_000 + f * 1500, 16, &[]);
    }
    drain(&mut ctx);
    let stats = ctx.session.stats_ref();
    let lost = stats.pkts_simulate_loss.load(Ordering::Relaxed);
    let received = stats.pkts_received.load(Ordering::Relaxed);
    assert!(lost > 0, "loss model never fired");
    assert_eq!(lost + received, 20 * 16);
}

#[test]
fn vsync_events_fire_on_epoch() {
    let mut ctx = make(|ops| {
        ops.flags.enable_vsync = true;
    });
    ctx.clock.advance(50_000_000); // three 60 Hz epochs later
    ctx.session.poll_control();
    let events = ctx.events.events.lock();
    assert_eq!(events.iter().filter(|e| e.contains("Vsync")).count(), 1);
    drop(events);
    ctx.clock.advance(17_000_000);
    ctx.session.poll_control();
    assert_eq!(ctx.events.events.lock().iter().filter(|e| e.contains("Vsync")).count(), 2);
}

#[test]
fn rtcp_session_emits_nacks_from_control_tasklet() {
    #[derive(Default)]
    struct CaptureTx {
        pkts: Mutex<Vec<Vec<u8>>>,
    }
    impl NackTx for CaptureTx {
        fn send_nack(&self, pkt: &[u8]) {
            self.pkts.lock().push(pkt.to_vec());
        }
    }
    let tx = Arc::new(CaptureTx::default());
    let tx2 = tx.clone();
    let mut ctx = make(move |ops| {
        ops.flags.enable_rtcp = true;
        ops.nack_tx = Some(tx2);
    });
    // rtcp mode runs two reorder slots
    assert_eq!(ctx.session.core_ref().unwrap().slot_max, 2);

    feed_frame(&ctx, 0, 1000, 90_000, 16, &[4, 5]);
    drain(&mut ctx);
    ctx.clock.advance(1_000_000); // well past the 250us nack interval
    ctx.session.poll_control();

    let pkts = tx.pkts.lock();
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0][1], 205);
    // PID is the first missing sequence (u16 of seq 1004)
    let pid = u16::from_be_bytes([pkts[0][12], pkts[0][13]]);
    assert_eq!(pid, 1004);
}

#[test]
fn cothread_spawns_for_fat_streams_and_reassembles() {
    let mut ctx = make(|ops| {
        // 8K120 comes in just under 80 Gbit/s of payload
        ops.width = 7680;
        ops.height = 4320;
        ops.fps = Fps::P120;
        ops.framebuff_cnt = 2;
    });
    assert!(ctx.session.has_cothread());
    let core = ctx.session.core_ref().unwrap().clone();
    assert_eq!(core.slot_max, crate::slot::SLOT_COUNT);

    // a few head-of-frame packets flow through the ring
    for i in 0..5u32 {
        let rtp = RtpHeader {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: TEST_PT,
            sequence: (4000 + i) as u16,
            timestamp: 90_000,
            ssrc: 0,
        };
        let srd = Srd {
            length: 1200,
            row: 0,
            offset: (i * 480) as u16,
            second_field: false,
            user_meta: false,
            continuation: false,
        };
        ctx.backend.feed(
            0,
            Mbuf::new(build_rfc4175(&rtp, 0, &srd, None, &[6u8; 1200]), ctx.clock.now_ns()),
        );
    }
    drain(&mut ctx);
    // the worker is asynchronous; wait for it to account the packets
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        if core.stats.pkts_received.load(Ordering::Relaxed) == 5 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "co-thread never processed packets");
        std::thread::yield_now();
    }
    let slot = &core.slots[core.slot_rr.load(Ordering::Relaxed)];
    // all bytes accounted on the co-thread side
    assert_eq!(slot.co_recv_size.load(Ordering::Relaxed), 5 * 1200);
    assert_eq!(slot.recv_size.load(Ordering::Relaxed), 0);
    ctx.session.detach();
}

#[test]
fn second_field_flag_reaches_frame_meta() {
    let mut ctx = make(|ops| {
        ops.height = 32; // 16 lines per field
        ops.interlaced = true;
    });
    for row in 0..16u16 {
        let rtp = RtpHeader {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: row == 15,
            payload_type: TEST_PT,
            sequence: 700 + row,
            timestamp: 90_000,
            ssrc: 0,
        };
        let srd = Srd {
            length: LINE_BYTES as u16,
            row,
            offset: 0,
            second_field: true,
            user_meta: false,
            continuation: false,
        };
        let pkt = build_rfc4175(&rtp, 0, &srd, None, &[9u8; LINE_BYTES]);
        ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    }
    drain(&mut ctx);
    let frames = ctx.events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, FrameStatus::Complete);
    assert_eq!(frames[0].1, 32 * 64 * 5 / 2 / 2); // one field
}

#[test]
fn line_padding_splits_copy_across_lines() {
    let mut ctx = make(|ops| {
        ops.linesize = 256; // padded lines, 160 bytes of pixels each
    });
    // packets carry 160 bytes of line n plus 40 bytes of line n+1 via the
    // extra SRD, so every write must split at the padding
    let rtp = RtpHeader {
        padding: false,
        extension: false,
        csrc_count: 0,
        marker: false,
        payload_type: TEST_PT,
        sequence: 800,
        timestamp: 90_000,
        ssrc: 0,
    };
    let srd = Srd {
        length: LINE_BYTES as u16,
        row: 2,
        offset: 0,
        second_field: false,
        user_meta: false,
        continuation: true,
    };
    let extra = Srd {
        length: 40,
        row: 3,
        offset: 0,
        second_field: false,
        user_meta: false,
        continuation: false,
    };
    let mut payload = vec![5u8; LINE_BYTES];
    payload.extend_from_slice(&[6u8; 40]);
    let pkt = build_rfc4175(&rtp, 0, &srd, Some(&extra), &payload);
    ctx.backend.feed(0, Mbuf::new(pkt, ctx.clock.now_ns()));
    drain(&mut ctx);

    let core = ctx.session.core_ref().unwrap();
    let slot = &core.slots[core.slot_rr.load(Ordering::Relaxed)];
    let ctl = slot.ctl.read();
    let frame = ctl.frame.as_ref().expect("frame in flight");
    let bytes = frame.bytes();
    assert!(bytes[2 * 256..2 * 256 + 160].iter().all(|b| *b == 5));
    assert!(bytes[3 * 256..3 * 256 + 40].iter().all(|b| *b == 6));
    // the padding byte between them stayed untouched
    assert_eq!(bytes[2 * 256 + 160], 0);
}

#[test]
fn dynamic_ext_frames_bind_per_frame_and_starve() {
    use crate::frame::{ExtBytes, ExtFrame};

    struct ExtEvents {
        bufs: Mutex<Vec<ExtFrame>>,
        frames: Mutex<Vec<(FrameStatus, u64, Vec<u8>)>>,
    }
    impl SessionEvents for ExtEvents {
        fn on_frame_ready(&self, frame: FrameLease, meta: &FrameMeta) {
            self.frames.lock().push((meta.status, meta.opaque, frame.bytes().to_vec()));
        }
        fn query_ext_frame(&self, _meta: &FrameMeta) -> Option<ExtFrame> {
            self.bufs.lock().pop()
        }
    }

    let app_buf = ExtBytes::new(2560);
    let events = Arc::new(ExtEvents {
        bufs: Mutex::new(vec![ExtFrame { data: app_buf.clone(), iova: 0x4000, opaque: 42 }]),
        frames: Mutex::new(Vec::new()),
    });
    let clock = TestClock::new(1_000_000_000);
    let backend = TestQueueBackend::new(1);
    let sources = vec![PortSource { ip: "239.0.0.1".parse().unwrap(), udp_port: 20000 }];
    let mut ops = RxOps::new("ext", sources, events.clone());
    ops.width = 64;
    ops.height = 16;
    ops.fps = Fps::P60;
    ops.payload_type = TEST_PT;
    ops.dynamic_ext_frame = true;
    ops.flags.receive_incomplete_frame = true;
    let deps = SessionDeps {
        backend: backend.clone(),
        dma: None,
        clock: clock.clone(),
        dma_page_size: None,
    };
    let session = Session::attach(0, ops, deps).unwrap();

    let mut ctx = Ctx { session, backend, clock, events: Arc::new(Collect::default()) };
    feed_frame(&ctx, 0, 1000, 90_000, 16, &[]);
    drain(&mut ctx);

    let frames = events.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, FrameStatus::Complete);
    assert_eq!(frames[0].1, 42);
    // the pixels landed in the application's buffer
    assert!(app_buf.bytes()[..LINE_BYTES].iter().all(|b| *b == 1));
    assert!(frames[0].2[..LINE_BYTES].iter().all(|b| *b == 1));
    drop(frames);

    // no buffer left for the next frame: every packet drops with the
    // query-fail counter rising
    feed_frame(&ctx, 0, 1016, 91_500, 16, &[]);
    drain(&mut ctx);
    let stats = ctx.session.stats_ref();
    assert!(stats.slot_query_ext_fail.load(Ordering::Relaxed) > 0);
    assert_eq!(events.frames.lock().len(), 1);
}
