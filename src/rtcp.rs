//! RTCP receiver feedback: sequence tracking and NACK emission.
//!
//! One engine per session port. The receive path reports every RTP sequence
//! number it sees; the control tasklet periodically asks the engine to emit
//! generic-NACK packets (RFC 4585, PT 205 / FMT 1) for gaps that have aged
//! past the NACK interval. Feedback leaves on `dst_port + 1` through a
//! pre-built packet prefix, the user-space analogue of the original's
//! Ethernet/IP/UDP header template.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use log::{debug, info};

use crate::error::Error;
use crate::rtp::sequence_diff;

/// NACK pacing when the application does not configure one, microseconds.
pub const DEFAULT_NACK_INTERVAL_US: u64 = 250;
/// Recent-sequence window size in bytes of bitmap when unconfigured.
pub const DEFAULT_SEQ_BITMAP_SIZE: usize = 16;
/// Tolerated jump ahead of the highest sequence when unconfigured.
pub const DEFAULT_SEQ_SKIP_WINDOW: u16 = 10;

/// RTCP feedback configuration, all zeroes meaning the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcpOps {
    pub nack_interval_us: u64,
    pub seq_bitmap_size: usize,
    pub seq_skip_window: u16,
}

/// Transmit half for feedback packets.
pub trait NackTx: Send + Sync {
    fn send_nack(&self, pkt: &[u8]);
}

/// Stock transmitter: UDP socket bound to `dst_port + 1`.
pub struct UdpNackTx {
    socket: UdpSocket,
    dst: SocketAddrV4,
}

impl UdpNackTx {
    pub fn new(source_ip: Ipv4Addr, dst_port: u16) -> Result<Self, Error> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, dst_port + 1))?;
        Ok(Self { socket, dst: SocketAddrV4::new(source_ip, dst_port + 1) })
    }
}

impl NackTx for UdpNackTx {
    fn send_nack(&self, pkt: &[u8]) {
        let _ = self.socket.send_to(pkt, self.dst);
    }
}

#[derive(Debug, Default, Clone)]
pub struct RtcpRxStats {
    pub nack_packets_sent: u64,
    pub seqs_nacked: u64,
    pub missing_detected: u64,
    pub recovered: u64,
    pub expired: u64,
    pub resets: u64,
}

#[derive(Debug, Clone, Copy)]
struct MissingSeq {
    seq: u16,
    since_ns: u64,
    last_nack_ns: u64,
}

/// Per-port receiver feedback engine.
pub struct RtcpRx {
    name: String,
    interval_ns: u64,
    window_seqs: u16,
    skip_window: u16,
    /// First 8 bytes + both SSRC words of every NACK, built once.
    pkt_prefix: [u8; 12],
    last_seq: Option<u16>,
    missing: VecDeque<MissingSeq>,
    stats: RtcpRxStats,
}

impl RtcpRx {
    pub fn new(name: &str, ops: &RtcpOps, ssrc: u32) -> Self {
        let interval_us = if ops.nack_interval_us != 0 {
            ops.nack_interval_us
        } else {
            DEFAULT_NACK_INTERVAL_US
        };
        let bitmap_size = if ops.seq_bitmap_size != 0 {
            ops.seq_bitmap_size
        } else {
            DEFAULT_SEQ_BITMAP_SIZE
        };
        let skip_window = if ops.seq_skip_window != 0 {
            ops.seq_skip_window
        } else {
            DEFAULT_SEQ_SKIP_WINDOW
        };

        let mut pkt_prefix = [0u8; 12];
        pkt_prefix[0] = (2 << 6) | 1; // V=2, FMT=1 generic NACK
        pkt_prefix[1] = 205; // RTPFB
        // bytes 2..4: length, patched per packet
        pkt_prefix[4..8].copy_from_slice(&ssrc.to_be_bytes()); // sender
        pkt_prefix[8..12].copy_from_slice(&ssrc.to_be_bytes()); // media source

        info!(
            "rtcp[{name}]: nack interval {interval_us}us window {} seqs skip {skip_window}",
            bitmap_size * 8
        );
        Self {
            name: name.to_string(),
            interval_ns: interval_us * 1_000,
            window_seqs: (bitmap_size * 8) as u16,
            skip_window,
            pkt_prefix,
            last_seq: None,
            missing: VecDeque::new(),
            stats: RtcpRxStats::default(),
        }
    }

    pub fn stats(&self) -> &RtcpRxStats {
        &self.stats
    }

    /// Observe one RTP sequence number from the receive path.
    pub fn on_rtp_seq(&mut self, seq: u16, now_ns: u64) {
        let last = match self.last_seq {
            Some(last) => last,
            None => {
                self.last_seq = Some(seq);
                return;
            }
        };
        let diff = sequence_diff(last, seq);
        if diff == 1 {
            self.last_seq = Some(seq);
        } else if diff > 1 {
            if diff as u32 > (self.window_seqs as u32 + self.skip_window as u32) {
                // Stream jumped: restart tracking rather than nack a flood.
                debug!("rtcp[{}]: seq jump {last} -> {seq}, reset", self.name);
                self.missing.clear();
                self.stats.resets += 1;
            } else {
                let mut s = last.wrapping_add(1);
                while s != seq {
                    self.missing.push_back(MissingSeq {
                        seq: s,
                        since_ns: now_ns,
                        last_nack_ns: 0,
                    });
                    self.stats.missing_detected += 1;
                    s = s.wrapping_add(1);
                }
            }
            self.last_seq = Some(seq);
        } else {
            // Late or retransmitted packet fills its gap.
            let before = self.missing.len();
            self.missing.retain(|m| m.seq != seq);
            if self.missing.len() != before {
                self.stats.recovered += 1;
            }
        }
        self.expire(now_ns);
    }

    fn expire(&mut self, _now_ns: u64) {
        let last = match self.last_seq {
            Some(l) => l,
            None => return,
        };
        let window = self.window_seqs;
        let expired = &mut self.stats.expired;
        self.missing.retain(|m| {
            let age = sequence_diff(m.seq, last);
            if age > window as i32 {
                *expired += 1;
                false
            } else {
                true
            }
        });
    }

    /// Emit NACKs for gaps older than the interval. Called by the control
    /// tasklet; self-paced, so call as often as convenient.
    pub fn send_nacks(&mut self, now_ns: u64, tx: &dyn NackTx) -> usize {
        let interval = self.interval_ns;
        let mut pids: Vec<(u16, u16)> = Vec::new();
        let mut i = 0;
        while i < self.missing.len() {
            let m = self.missing[i];
            let aged = now_ns.saturating_sub(m.since_ns) >= interval;
            let renack = m.last_nack_ns == 0
                || now_ns.saturating_sub(m.last_nack_ns) >= interval;
            if aged && renack {
                // Fold into an existing PID's bitmap when in range.
                let mut folded = false;
                for (pid, blp) in pids.iter_mut() {
                    let d = sequence_diff(*pid, m.seq);
                    if d > 0 && d <= 16 {
                        *blp |= 1 << (d - 1);
                        folded = true;
                        break;
                    }
                }
                if !folded {
                    pids.push((m.seq, 0));
                }
                self.missing[i].last_nack_ns = now_ns;
                self.stats.seqs_nacked += 1;
            }
            i += 1;
        }
        if pids.is_empty() {
            return 0;
        }
        let pkt = self.build_nack(&pids);
        tx.send_nack(&pkt);
        self.stats.nack_packets_sent += 1;
        pids.len()
    }

    fn build_nack(&self, fci: &[(u16, u16)]) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(12 + fci.len() * 4);
        pkt.extend_from_slice(&self.pkt_prefix);
        // length counts 32-bit words minus one: 3 header words + one per FCI
        let length = (2 + fci.len()) as u16;
        pkt[2..4].copy_from_slice(&length.to_be_bytes());
        for (pid, blp) in fci {
            pkt.extend_from_slice(&pid.to_be_bytes());
            pkt.extend_from_slice(&blp.to_be_bytes());
        }
        pkt
    }
}
