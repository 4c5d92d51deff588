//! Error types for the receive path.
//!
//! Control-path failures (attach, queue setup, bad configuration) surface as
//! [`Error`]. Per-packet rejections never propagate as errors: they are
//! counted into session statistics and the packet is dropped, so the hot
//! path stays allocation- and unwind-free.

use thiserror::Error;

/// Control-path error.
#[derive(Debug, Error)]
pub enum Error {
    /// Session configuration rejected before any resource was taken.
    #[error("invalid session config: {0}")]
    InvalidOps(&'static str),

    /// The receive-queue backend could not provide a queue for the flow.
    #[error("rx queue setup failed: {0}")]
    Queue(String),

    /// Socket-level failure in the stock UDP backend.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// All manager session slots are occupied.
    #[error("no free session slot")]
    NoSessionSlot,

    /// Handle does not name a live session (stale generation or bad index).
    #[error("unknown session {0}")]
    UnknownSession(usize),

    /// Frame pool could not be built (bad external frame set, zero count).
    #[error("frame pool setup failed: {0}")]
    FramePool(&'static str),

    /// The format detector gave up on this stream.
    #[error("format detection failed")]
    DetectFailed,
}

/// Why a packet was dropped on the receive path. One counter per reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktDropReason {
    /// Payload type mismatch, short packet, bad box header, kmode set.
    WrongHeader,
    /// Packet arrived in more than one buffer segment.
    MultiSegment,
    /// No reassembly slot available, or the frame pool was exhausted.
    NoSlot,
    /// Sequence base not captured yet and this path may not capture it.
    BaseNotCaptured,
    /// Computed packet index fell outside the slot bitmap.
    OutOfWindow,
    /// Destination range exceeded the frame size allowance.
    OffsetOutOfBounds,
    /// User-meta payload larger than the per-frame meta buffer.
    UserMetaTooBig,
    /// RTP passthrough ring was full.
    RtpRingFull,
    /// Header-split packet was not block-packed and carried no marker.
    NotBpm,
    /// Header-split payload landed at an unrecoverable address.
    WrongPayloadHdrSplit,
    /// Dropped by the simulated-loss model.
    SimulatedLoss,
}
