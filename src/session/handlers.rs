//! The per-packet receive paths.
//!
//! Every handler shares the same preamble: parse the RTP header, reject on
//! payload-type mismatch, find the reassembly slot by RTP timestamp. They
//! differ in how the packet index and destination offset are derived and in
//! how the payload reaches the framebuffer.

use std::sync::atomic::Ordering;

use ringbuf::traits::Producer;

use crate::error::PktDropReason;
use crate::frame::SlotBinding;
use crate::hdr_split::BPM_PAYLOAD_SIZE;
use crate::ops::{FrameMeta, FrameStatus, SliceMeta, UframePgMeta};
use crate::queue::{Mbuf, MAX_UDP_PAYLOAD};
use crate::rtp::{
    ext_seq32, parse_st22_boxes, seq_dist16, seq_dist32, Rfc4175Pkt, Rfc9134Pkt, RtpHeader,
    RFC4175_HDR_LEN, RTP_HDR_LEN,
};
use crate::slot::{Slot, SliceOutcome, SLOT_COUNT};
use crate::stats::{add, bump};

use super::{DmaCtx, PktCtx, SessionCore, DMA_MIN_COPY_SIZE, RX_BURST_SIZE};

/// Find or open the slot for `tmstamp`. Structural changes are restricted
/// to the slot-owning thread; anybody else only gets existing slots.
fn slot_for_tmstamp(
    core: &SessionCore,
    dma: &mut Option<DmaCtx>,
    tmstamp: u32,
    ctx: PktCtx,
    hdr_split_base: Option<usize>,
) -> Option<usize> {
    for i in 0..core.slot_max {
        if core.slots[i].ctl.read().tmstamp == tmstamp {
            return Some(i);
        }
    }
    if !ctx.slot_owner {
        return None;
    }
    if let Some(d) = dma.as_mut() {
        if !d.lender.empty() {
            // previous frame still has writes in flight; a new frame must
            // not start allocating before they retire
            bump(&core.stats.dma_previous_busy);
            return None;
        }
    }

    let rr = (core.slot_rr.load(Ordering::Relaxed) + 1) % core.slot_max;
    let slot = &core.slots[rr];
    let mut ctl = slot.ctl.write();

    if ctl.frame.is_some() {
        if core.st22.is_some() {
            st22_frame_close(core, slot, &mut ctl, FrameStatus::Corrupted);
        } else {
            frame_close(core, slot, &mut ctl);
        }
    }

    let now = core.clock.now_ns();
    slot.rearm(&mut ctl, tmstamp, now);
    core.slot_rr.store(rr, Ordering::Relaxed);

    let pool = core.pool.as_ref()?;
    let frame = match pool.acquire() {
        Some(f) => f,
        None => {
            bump(&core.stats.slot_get_frame_fail);
            return None;
        }
    };
    frame.clear_user_meta();

    if let Some(base) = hdr_split_base {
        let hs = core.hdr_split.as_ref().expect("hdr split state present");
        frame.bind(SlotBinding::Region(hs.region().clone(), base));
    }
    if core.dynamic_ext {
        let meta = frame_meta_skeleton(core, tmstamp, now);
        match core.events.query_ext_frame(&meta) {
            Some(ext) if ext.data.len() >= frame.size() => {
                frame.bind(SlotBinding::Ext(ext))
            }
            _ => {
                bump(&core.stats.slot_query_ext_fail);
                pool.put(&frame);
                return None;
            }
        }
    }

    ctl.frame = Some(frame);
    if let Some(d) = dma.as_mut() {
        d.dma_slot = Some(rr);
    }
    bump(&core.stats.cbs_frame_slot_cnt);
    Some(rr)
}

fn frame_meta_skeleton(core: &SessionCore, tmstamp: u32, now_ns: u64) -> FrameMeta {
    let geo = &core.geo;
    FrameMeta {
        width: geo.width,
        height: geo.height,
        fmt: geo.fmt,
        fps: geo.fps,
        timestamp: tmstamp,
        timestamp_first_pkt_ns: now_ns,
        timestamp_last_pkt_ns: now_ns,
        fpt_ns: 0.0,
        second_field: false,
        frame_total_size: geo.frame_size,
        uframe_total_size: geo.uframe_size,
        frame_recv_size: 0,
        user_meta_size: 0,
        status: FrameStatus::Complete,
        opaque: 0,
    }
}

/// Close the slot's frame, deciding Complete/Reconstructed/Corrupted from
/// the received size and the redundant-port contribution.
fn frame_close(core: &SessionCore, slot: &Slot, ctl: &mut crate::slot::SlotCtl) {
    let frame = match ctl.frame.take() {
        Some(f) => f,
        None => return,
    };
    let pool = core.pool.as_ref().expect("frame mode has a pool");
    let geo = &core.geo;
    let recv = slot.frame_recv_size();
    let received = slot.pkts_received.load(Ordering::Relaxed);
    let redundant = slot.pkts_redundant.load(Ordering::Relaxed);

    let epochs = (ctl.first_pkt_ns as f64 / geo.frame_time) as u64;
    let fpt = ctl.first_pkt_ns as f64 - epochs as f64 * geo.frame_time;

    let mut meta = FrameMeta {
        width: geo.width,
        height: geo.height,
        fmt: geo.fmt,
        fps: geo.fps,
        timestamp: ctl.tmstamp,
        timestamp_first_pkt_ns: ctl.first_pkt_ns,
        timestamp_last_pkt_ns: core.clock.now_ns(),
        fpt_ns: fpt,
        second_field: slot.second_field.load(Ordering::Acquire),
        frame_total_size: geo.frame_size,
        uframe_total_size: geo.uframe_size,
        frame_recv_size: recv,
        user_meta_size: frame.user_meta().len(),
        status: FrameStatus::Corrupted,
        opaque: frame.opaque(),
    };

    if recv >= geo.frame_size {
        meta.status = FrameStatus::Complete;
        if core.num_ports > 1 && redundant + super::RECONSTRUCT_SLACK_PKTS < received {
            meta.status = FrameStatus::Reconstructed;
        }
        bump(&core.stats.frames_received);
        bump(&core.port_stats[0].frames);
        core.events.on_frame_ready(pool.lease(frame.clone()), &meta);
    } else {
        bump(&core.stats.frames_dropped);
        if received > 0 && recv > 0 {
            let per_pkt = recv as f64 / received as f64;
            let miss = ((geo.frame_size - recv) as f64 / per_pkt) as u64;
            add(&core.stats.frames_pkts_missed, miss);
        }
        bump(&core.stats.cbs_incomplete_frame_cnt);
        if core.flags.receive_incomplete_frame {
            core.events.on_frame_ready(pool.lease(frame.clone()), &meta);
        }
    }
    // a slot-bound frame keeps its binding until the next slot assignment
    // rebinds it, so a lease held by the application stays readable
    pool.put(&frame);
}

fn st22_frame_close(
    core: &SessionCore,
    slot: &Slot,
    ctl: &mut crate::slot::SlotCtl,
    status: FrameStatus,
) {
    let frame = match ctl.frame.take() {
        Some(f) => f,
        None => return,
    };
    let pool = core.pool.as_ref().expect("frame mode has a pool");
    let geo = &core.geo;
    let recv = slot.frame_recv_size();
    let received = slot.pkts_received.load(Ordering::Relaxed);

    let mut meta = frame_meta_skeleton(core, ctl.tmstamp, core.clock.now_ns());
    meta.timestamp_first_pkt_ns = ctl.first_pkt_ns;
    // for compressed video the announced size is what actually arrived
    meta.frame_total_size = recv;
    meta.frame_recv_size = recv;
    meta.status = status;

    if status != FrameStatus::Corrupted {
        bump(&core.stats.frames_received);
        bump(&core.port_stats[0].frames);
        core.events.on_frame_ready(pool.lease(frame.clone()), &meta);
    } else {
        bump(&core.stats.frames_dropped);
        let expect = ctl.st22_expect_size;
        if expect > recv && received > 0 && recv > 0 {
            let per_pkt = expect as f64 / received as f64;
            let miss = ((expect - recv) as f64 / per_pkt) as u64;
            add(&core.stats.frames_pkts_missed, miss);
        }
        bump(&core.stats.cbs_incomplete_frame_cnt);
        if core.flags.receive_incomplete_frame {
            core.events.on_frame_ready(pool.lease(frame.clone()), &meta);
        }
    }
    pool.put(&frame);
    ctl.st22_expect_size = 0;
}

/// Close a finished frame and leave the slot armed for late duplicates.
fn slot_full_frame(core: &SessionCore, slot_idx: usize) {
    let slot = &core.slots[slot_idx];
    let mut ctl = slot.ctl.write();
    if core.st22.is_some() {
        st22_frame_close(core, slot, &mut ctl, FrameStatus::Complete);
    } else {
        frame_close(core, slot, &mut ctl);
    }
    slot.recv_size.store(0, Ordering::Release);
    slot.co_recv_size.store(0, Ordering::Release);
    slot.pkts_received.store(0, Ordering::Release);
    slot.pkts_redundant.store(0, Ordering::Release);
}

fn slice_add(core: &SessionCore, slot: &Slot, offset: u32, size: u32) {
    let tracker = match &slot.slice {
        Some(t) => t,
        None => return,
    };
    let mut t = tracker.lock();
    let merged_before = t.merged;
    let outcome = t.add(offset, size, core.geo.slice_size);
    let merged_now = t.merged - merged_before;
    drop(t);
    if merged_now > 0 {
        add(&core.stats.pkts_slice_merged, merged_now as u64);
    }
    match outcome {
        SliceOutcome::Ready(ready) => {
            let ctl = slot.ctl.read();
            if let Some(frame) = &ctl.frame {
                let meta = SliceMeta {
                    timestamp: ctl.tmstamp,
                    second_field: slot.second_field.load(Ordering::Acquire),
                    frame_recv_size: slot.frame_recv_size(),
                    frame_recv_lines: ready * core.geo.slice_lines,
                };
                core.events.on_slice_ready(frame, &meta);
                bump(&core.stats.slices_received);
            }
        }
        SliceOutcome::Accepted => {}
        SliceOutcome::Fail => bump(&core.stats.pkts_slice_fail),
    }
}

/// Drain retired DMA descriptors; when the engine runs dry and the slot's
/// byte count says complete, close the frame. Runs before new bursts so a
/// frame is never announced with payload still in flight.
pub(crate) fn dma_dequeue(core: &SessionCore, dma: &mut DmaCtx) {
    let slice_slot = dma.dma_slot;
    let mut on_drop = |off: u32, len: u32| {
        if let Some(idx) = slice_slot {
            slice_add(core, &core.slots[idx], off, len);
        }
    };
    dma.lender.completed(RX_BURST_SIZE, Some(&mut on_drop));

    if dma.lender.empty() {
        if let Some(idx) = dma.dma_slot {
            let slot = &core.slots[idx];
            let has_frame = slot.ctl.read().frame.is_some();
            if has_frame && slot.frame_recv_size() >= core.geo.frame_size {
                slot_full_frame(core, idx);
                dma.dma_slot = None;
            }
        }
    }
}

/// ST 2110-20 frame-level handler (RFC 4175).
pub(crate) fn handle_frame_pkt(
    core: &SessionCore,
    dma: &mut Option<DmaCtx>,
    mbuf: &Mbuf,
    ctx: PktCtx,
) -> Result<(), PktDropReason> {
    let stats = &core.stats;
    let geo = &core.geo;

    let pkt = match Rfc4175Pkt::parse(&mbuf.data) {
        Some(p) => p,
        None => {
            bump(&stats.pkts_wrong_hdr_dropped);
            return Err(PktDropReason::WrongHeader);
        }
    };
    if pkt.rtp.payload_type != core.payload_type {
        bump(&stats.pkts_wrong_hdr_dropped);
        return Err(PktDropReason::WrongHeader);
    }
    if mbuf.extra_seg.is_some() {
        bump(&stats.pkts_multi_segments);
        return Err(PktDropReason::MultiSegment);
    }
    let declared = pkt.declared_len();
    if declared == 0 || pkt.payload.len() < declared {
        bump(&stats.pkts_wrong_hdr_dropped);
        return Err(PktDropReason::WrongHeader);
    }

    let tmstamp = pkt.rtp.timestamp;
    let slot_idx = match slot_for_tmstamp(core, dma, tmstamp, ctx, None) {
        Some(i) => i,
        None => {
            bump(&stats.pkts_no_slot);
            return Err(PktDropReason::NoSlot);
        }
    };
    let slot = &core.slots[slot_idx];

    let frame = match &slot.ctl.read().frame {
        Some(f) => f.clone(),
        None => {
            bump(&stats.pkts_no_slot);
            return Err(PktDropReason::NoSlot);
        }
    };

    // side channel: payload is user metadata, not pixels
    if pkt.srd.user_meta {
        let len = pkt.srd.length as usize;
        if len <= pkt.payload.len() && frame.set_user_meta(&pkt.payload[..len]) {
            bump(&stats.pkts_user_meta);
            return Ok(());
        }
        bump(&stats.pkts_user_meta_err);
        return Err(PktDropReason::UserMetaTooBig);
    }

    slot.second_field.store(pkt.srd.second_field, Ordering::Release);

    let offset = pkt.srd.row as usize * geo.linesize
        + (pkt.srd.offset as u32 / geo.pg.coverage * geo.pg.size) as usize;
    if offset + declared > geo.fb_size + geo.bytes_in_line - geo.linesize {
        bump(&stats.pkts_offset_dropped);
        return Err(PktDropReason::OffsetOutOfBounds);
    }

    let seq32 = pkt.seq32();
    let pkt_idx;
    {
        let ctl = slot.ctl.read();
        if ctl.seq_got {
            let idx = seq_dist32(seq32, ctl.seq_base32) as usize;
            drop(ctl);
            if idx >= slot.bitmap.capacity() {
                bump(&stats.pkts_idx_oo_bitmap);
                return Err(PktDropReason::OutOfWindow);
            }
            if slot.bitmap.test_and_set(idx) {
                bump(&stats.pkts_redundant_dropped);
                slot.pkts_redundant.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            pkt_idx = idx;
        } else {
            drop(ctl);
            if !ctx.slot_owner {
                bump(&stats.pkts_idx_dropped);
                return Err(PktDropReason::BaseNotCaptured);
            }
            // derive the packet index of this packet within the frame from
            // its position, then anchor the sequence base on it
            let idx = if offset % declared != 0 {
                // single-line packing: indices advance per line fragment
                let bytes_in_pkt = MAX_UDP_PAYLOAD - RTP_HDR_LEN - RFC4175_HDR_LEN;
                let pkts_in_line = geo.bytes_in_line / bytes_in_pkt + 1;
                let pixels_in_pkt = (geo.width as usize + pkts_in_line - 1) / pkts_in_line;
                pkt.srd.row as usize * pkts_in_line + pkt.srd.offset as usize / pixels_in_pkt
            } else {
                offset / declared
            };
            if idx >= slot.bitmap.capacity() {
                bump(&stats.pkts_idx_oo_bitmap);
                return Err(PktDropReason::OutOfWindow);
            }
            let mut ctl = slot.ctl.write();
            ctl.seq_base32 = seq32.wrapping_sub(idx as u32);
            ctl.seq_got = true;
            drop(ctl);
            slot.bitmap.test_and_set(idx);
            pkt_idx = idx;
        }
    }

    if ctx.slot_owner {
        if let Some(ebu) = &core.ebu {
            ebu.lock().on_packet(tmstamp, mbuf.rx_time_ns, pkt_idx as u32);
        }
    }

    let mut dma_copied = false;
    if geo.uframe_size != 0 {
        // user-frame mode: the application owns pixel placement
        let first_len = pkt.srd.length as usize;
        let meta = UframePgMeta {
            row_length: pkt.srd.length,
            row_number: pkt.srd.row,
            row_offset: pkt.srd.offset,
            pg_cnt: pkt.srd.length as u32 / geo.pg.size,
            timestamp: tmstamp,
        };
        core.events.on_uframe_pg(&frame, &meta, &pkt.payload[..first_len]);
        if let Some(extra) = pkt.extra_srd {
            let meta = UframePgMeta {
                row_length: extra.length,
                row_number: extra.row,
                row_offset: extra.offset,
                pg_cnt: extra.length as u32 / geo.pg.size,
                timestamp: tmstamp,
            };
            core.events.on_uframe_pg(&frame, &meta, &pkt.payload[first_len..declared]);
        }
    } else if pkt.extra_srd.is_some() && geo.linesize > geo.bytes_in_line {
        // the packet spans the line padding: two per-line copies
        let first_len = pkt.srd.length as usize;
        frame.write(offset, &pkt.payload[..first_len]);
        frame.write(
            (pkt.srd.row as usize + 1) * geo.linesize,
            &pkt.payload[first_len..declared],
        );
    } else {
        let mut offloaded = false;
        if let Some(d) = dma.as_mut() {
            if declared > DMA_MIN_COPY_SIZE
                && !d.lender.full()
                && !frame.range_crosses_page(offset, declared)
            {
                let payload_off = mbuf.data.len() - pkt.payload.len();
                let src = mbuf.data.slice(payload_off..payload_off + declared);
                if d.lender.copy(&frame, offset, src).is_ok() {
                    d.lender.borrow_mbuf(mbuf.clone(), offset as u32, declared as u32);
                    d.copied = true;
                    bump(&stats.pkts_dma);
                    dma_copied = true;
                    offloaded = true;
                }
            }
        }
        if !offloaded {
            frame.write(offset, &pkt.payload[..declared]);
        }
    }

    slot.add_recv_size(declared as u64, ctx.co_thread);
    bump(&stats.pkts_received);
    slot.pkts_received.fetch_add(1, Ordering::Relaxed);

    if slot.slice.is_some() && !dma_copied {
        slice_add(core, slot, offset as u32, declared as u32);
    }

    if ctx.slot_owner && slot.frame_recv_size() >= geo.frame_size {
        let dma_drained = dma.as_ref().map(|d| d.lender.empty()).unwrap_or(true);
        if dma_drained {
            slot_full_frame(core, slot_idx);
            if let Some(d) = dma.as_mut() {
                if d.dma_slot == Some(slot_idx) {
                    d.dma_slot = None;
                }
            }
        }
    }
    Ok(())
}

/// ST 2110-22 handler (RFC 9134): packet index travels in the payload
/// header, the marker packet announces the frame size.
pub(crate) fn handle_st22_pkt(
    core: &SessionCore,
    dma: &mut Option<DmaCtx>,
    mbuf: &Mbuf,
    ctx: PktCtx,
) -> Result<(), PktDropReason> {
    let stats = &core.stats;
    let geo = &core.geo;
    let st22 = core.st22.as_ref().expect("st22 mode");

    let pkt = match Rfc9134Pkt::parse(&mbuf.data) {
        Some(p) => p,
        None => {
            bump(&stats.pkts_wrong_hdr_dropped);
            return Err(PktDropReason::WrongHeader);
        }
    };
    if pkt.rtp.payload_type != core.payload_type || pkt.kmode || pkt.payload.is_empty() {
        bump(&stats.pkts_wrong_hdr_dropped);
        return Err(PktDropReason::WrongHeader);
    }

    let tmstamp = pkt.rtp.timestamp;
    let seq = pkt.rtp.sequence;
    let pkt_counter = pkt.pkt_idx() as usize;
    let payload_len = pkt.payload.len();

    let slot_idx = match slot_for_tmstamp(core, dma, tmstamp, ctx, None) {
        Some(i) => i,
        None => {
            bump(&stats.pkts_no_slot);
            return Err(PktDropReason::NoSlot);
        }
    };
    let slot = &core.slots[slot_idx];

    {
        let ctl = slot.ctl.read();
        if ctl.seq_got {
            if !pkt.rtp.marker && payload_len != ctl.st22_payload_len as usize {
                bump(&stats.pkts_wrong_hdr_dropped);
                return Err(PktDropReason::WrongHeader);
            }
            let idx = seq_dist16(seq, ctl.seq_base16) as usize;
            drop(ctl);
            if idx >= slot.bitmap.capacity() {
                bump(&stats.pkts_idx_oo_bitmap);
                return Err(PktDropReason::OutOfWindow);
            }
            if slot.bitmap.test_and_set(idx) {
                bump(&stats.pkts_redundant_dropped);
                slot.pkts_redundant.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        } else {
            drop(ctl);
            if !ctx.slot_owner {
                bump(&stats.pkts_idx_dropped);
                return Err(PktDropReason::BaseNotCaptured);
            }
            let box_len = if pkt_counter == 0 && !st22.disable_boxes {
                match parse_st22_boxes(pkt.payload) {
                    Some(len) => len,
                    None => {
                        bump(&stats.pkts_idx_dropped);
                        return Err(PktDropReason::WrongHeader);
                    }
                }
            } else {
                0
            };
            if pkt_counter >= slot.bitmap.capacity() {
                bump(&stats.pkts_idx_oo_bitmap);
                return Err(PktDropReason::OutOfWindow);
            }
            let mut ctl = slot.ctl.write();
            ctl.seq_base16 = seq.wrapping_sub(pkt_counter as u16);
            ctl.st22_payload_len = payload_len as u16;
            ctl.st22_box_hdr_len = box_len;
            ctl.seq_got = true;
            drop(ctl);
            slot.bitmap.test_and_set(pkt_counter);
        }
    }

    let (frame, box_len, unit_len) = {
        let ctl = slot.ctl.read();
        match &ctl.frame {
            Some(f) => (f.clone(), ctl.st22_box_hdr_len as usize, ctl.st22_payload_len as usize),
            None => {
                bump(&stats.pkts_no_slot);
                return Err(PktDropReason::NoSlot);
            }
        }
    };

    let (offset, payload) = if pkt_counter == 0 {
        (0usize, &pkt.payload[box_len.min(payload_len)..])
    } else {
        match (pkt_counter * unit_len).checked_sub(box_len) {
            Some(off) => (off, pkt.payload),
            None => {
                bump(&stats.pkts_offset_dropped);
                return Err(PktDropReason::OffsetOutOfBounds);
            }
        }
    };
    if offset + payload.len() > geo.frame_size as usize {
        bump(&stats.pkts_offset_dropped);
        return Err(PktDropReason::OffsetOutOfBounds);
    }
    frame.write(offset, payload);
    slot.add_recv_size(payload.len() as u64, ctx.co_thread);
    bump(&stats.pkts_received);
    slot.pkts_received.fetch_add(1, Ordering::Relaxed);

    if pkt.rtp.marker {
        slot.ctl.write().st22_expect_size = (offset + payload.len()) as u64;
    }
    if ctx.slot_owner {
        let expect = slot.ctl.read().st22_expect_size;
        if expect != 0 && slot.frame_recv_size() == expect {
            slot_full_frame(core, slot_idx);
        }
    }
    Ok(())
}

/// Header-split handler: the NIC already wrote the payload into the region;
/// verify it landed where the packet index says it should be.
pub(crate) fn handle_hdr_split_pkt(
    core: &SessionCore,
    mbuf: &Mbuf,
    ctx: PktCtx,
) -> Result<(), PktDropReason> {
    let stats = &core.stats;
    let geo = &core.geo;
    let hs = core.hdr_split.as_ref().expect("hdr split mode");

    let pkt = match Rfc4175Pkt::parse(&mbuf.data) {
        Some(p) => p,
        None => {
            bump(&stats.pkts_wrong_hdr_dropped);
            return Err(PktDropReason::WrongHeader);
        }
    };
    if pkt.rtp.payload_type != core.payload_type {
        bump(&stats.pkts_wrong_hdr_dropped);
        return Err(PktDropReason::WrongHeader);
    }
    if !hs.pool_ready() {
        bump(&stats.pkts_no_slot);
        return Err(PktDropReason::NoSlot);
    }
    let split_off = match mbuf.split_off {
        Some(off) => off,
        None => {
            bump(&stats.pkts_wrong_payload_hdr_split);
            return Err(PktDropReason::WrongPayloadHdrSplit);
        }
    };

    let tmstamp = pkt.rtp.timestamp;
    let mut no_dma = None;
    let slot_idx = match slot_for_tmstamp(core, &mut no_dma, tmstamp, ctx, Some(split_off)) {
        Some(i) => i,
        None => {
            bump(&stats.pkts_no_slot);
            return Err(PktDropReason::NoSlot);
        }
    };
    let slot = &core.slots[slot_idx];

    let frame = match &slot.ctl.read().frame {
        Some(f) => f.clone(),
        None => {
            bump(&stats.pkts_no_slot);
            return Err(PktDropReason::NoSlot);
        }
    };
    slot.second_field.store(pkt.srd.second_field, Ordering::Release);

    let seq32 = pkt.seq32();
    let pkt_idx;
    {
        let ctl = slot.ctl.read();
        if ctl.seq_got {
            let idx = seq_dist32(seq32, ctl.seq_base32) as usize;
            drop(ctl);
            if idx >= slot.bitmap.capacity() {
                bump(&stats.pkts_idx_oo_bitmap);
                return Err(PktDropReason::OutOfWindow);
            }
            if slot.bitmap.test_and_set(idx) {
                bump(&stats.pkts_redundant_dropped);
                slot.pkts_redundant.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            pkt_idx = idx;
        } else {
            drop(ctl);
            // only the opening packet of a frame may anchor the base; the
            // NIC placement verification depends on it
            if !ctx.slot_owner || pkt.srd.row != 0 || pkt.srd.offset != 0 {
                bump(&stats.pkts_idx_dropped);
                return Err(PktDropReason::BaseNotCaptured);
            }
            let mut ctl = slot.ctl.write();
            ctl.seq_base32 = seq32;
            ctl.seq_got = true;
            drop(ctl);
            slot.bitmap.test_and_set(0);
            pkt_idx = 0;
        }
    }

    let offset = (pkt.srd.row as usize * geo.width as usize + pkt.srd.offset as usize)
        / geo.pg.coverage as usize
        * geo.pg.size as usize;
    let declared = pkt.declared_len();
    if offset + declared > geo.frame_size as usize {
        bump(&stats.pkts_offset_dropped);
        return Err(PktDropReason::OffsetOutOfBounds);
    }
    let marker = pkt.rtp.marker;
    if declared != BPM_PAYLOAD_SIZE && !marker {
        bump(&stats.pkts_not_bpm);
        return Err(PktDropReason::NotBpm);
    }

    let mut need_copy = false;
    if pkt_idx == 0 {
        let buf_idx = (split_off / BPM_PAYLOAD_SIZE) as u32;
        if !hs.set_cur_frame_mbuf_idx(buf_idx) {
            bump(&stats.mismatch_hdr_split_frame);
        }
    } else {
        let base = frame.region_base().unwrap_or(0);
        let expected = base + pkt_idx * BPM_PAYLOAD_SIZE;
        if expected != split_off {
            // reordering or a missed packet shifted the landing zone
            if marker && expected + declared <= hs.region().len() {
                need_copy = true;
                bump(&stats.pkts_copy_hdr_split);
            } else {
                bump(&stats.pkts_wrong_payload_hdr_split);
                return Err(PktDropReason::WrongPayloadHdrSplit);
            }
        }
    }

    if need_copy {
        let tmp = hs.region().bytes()[split_off..split_off + declared].to_vec();
        frame.write(offset, &tmp);
    }

    slot.add_recv_size(declared as u64, ctx.co_thread);
    bump(&stats.pkts_received);
    slot.pkts_received.fetch_add(1, Ordering::Relaxed);

    if slot.slice.is_some() {
        slice_add(core, slot, offset as u32, declared as u32);
    }
    if ctx.slot_owner && slot.frame_recv_size() >= geo.frame_size {
        slot_full_frame(core, slot_idx);
    }
    Ok(())
}

/// RTP passthrough: account sequence state, hand the packet to the
/// application ring untouched.
pub(crate) fn handle_rtp_pkt(
    core: &SessionCore,
    mbuf: &Mbuf,
    ctx: PktCtx,
) -> Result<(), PktDropReason> {
    let stats = &core.stats;

    let rtp = match RtpHeader::parse(&mbuf.data) {
        Some(h) => h,
        None => {
            bump(&stats.pkts_wrong_hdr_dropped);
            return Err(PktDropReason::WrongHeader);
        }
    };
    if rtp.payload_type != core.payload_type {
        bump(&stats.pkts_wrong_hdr_dropped);
        return Err(PktDropReason::WrongHeader);
    }
    let seq = rtp.sequence;
    // uncompressed RTP-level streams still carry the RFC 4175 extended
    // sequence right after the fixed header
    let seq_ext = if mbuf.data.len() >= RTP_HDR_LEN + 2 {
        u16::from_be_bytes([mbuf.data[RTP_HDR_LEN], mbuf.data[RTP_HDR_LEN + 1]])
    } else {
        0
    };
    let seq32 = ext_seq32(seq, seq_ext);

    let slot_idx = match rtp_slot_for_tmstamp(core, rtp.timestamp, ctx) {
        Some(i) => i,
        None => {
            bump(&stats.pkts_no_slot);
            return Err(PktDropReason::NoSlot);
        }
    };
    let slot = &core.slots[slot_idx];

    {
        let ctl = slot.ctl.read();
        if ctl.seq_got {
            let idx = if core.st22.is_some() {
                seq_dist16(seq, ctl.seq_base16) as usize
            } else {
                seq_dist32(seq32, ctl.seq_base32) as usize
            };
            drop(ctl);
            if idx >= slot.bitmap.capacity() {
                bump(&stats.pkts_idx_oo_bitmap);
                return Err(PktDropReason::OutOfWindow);
            }
            if slot.bitmap.test_and_set(idx) {
                bump(&stats.pkts_redundant_dropped);
                return Ok(());
            }
        } else {
            drop(ctl);
            if !ctx.slot_owner {
                bump(&stats.pkts_idx_dropped);
                return Err(PktDropReason::BaseNotCaptured);
            }
            let mut ctl = slot.ctl.write();
            ctl.seq_base16 = seq;
            ctl.seq_base32 = seq32;
            ctl.seq_got = true;
            drop(ctl);
            slot.bitmap.test_and_set(0);
            bump(&stats.frames_received);
            bump(&core.port_stats[0].frames);
        }
    }

    let prod = core.rtp_prod.as_ref().expect("rtp mode has a ring");
    if prod.lock().try_push(mbuf.clone()).is_err() {
        bump(&stats.pkts_rtp_ring_full);
        return Err(PktDropReason::RtpRingFull);
    }
    core.events.on_rtp_ready();
    bump(&stats.pkts_received);
    Ok(())
}

/// Slot lookup for RTP passthrough: all slots are in play and no frame or
/// DMA state is involved, so recycling is just a re-arm.
fn rtp_slot_for_tmstamp(core: &SessionCore, tmstamp: u32, ctx: PktCtx) -> Option<usize> {
    for i in 0..SLOT_COUNT {
        if core.slots[i].ctl.read().tmstamp == tmstamp {
            return Some(i);
        }
    }
    if !ctx.slot_owner {
        return None;
    }
    let rr = (core.slot_rr.load(Ordering::Relaxed) + 1) % SLOT_COUNT;
    let slot = &core.slots[rr];
    let mut ctl = slot.ctl.write();
    slot.rearm(&mut ctl, tmstamp, core.clock.now_ns());
    core.slot_rr.store(rr, Ordering::Relaxed);
    Some(rr)
}
