//! User-space receive library for professional video over IP.
//!
//! Implements the receive side of SMPTE ST 2110-20 (uncompressed video,
//! RFC 4175) and ST 2110-22 (JPEG-XS, RFC 9134): per-session reassembly
//! with per-frame packet bitmaps across one or two redundant ports,
//! optional DMA offload of payload placement, EBU/SMPTE timing compliance
//! measurement, RTCP NACK feedback and auto-detection of unknown formats.
//!
//! The manager owns sessions and drives them from one scheduler thread
//! through two cooperative tasklets; very fat streams get a dedicated
//! packet co-thread. Packet I/O is abstracted behind [`queue::QueueBackend`]
//! (a socket2/UDP implementation ships in-tree), DMA behind
//! [`dma::DmaProvider`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use st2110_rx::clock::MonotonicClock;
//! use st2110_rx::manager::{ManagerConfig, RxVideoManager, Scheduler};
//! use st2110_rx::ops::{FrameMeta, PortSource, RxOps, SessionEvents};
//! use st2110_rx::queue::UdpQueueBackend;
//!
//! struct App;
//! impl SessionEvents for App {
//!     fn on_frame_ready(&self, frame: st2110_rx::frame::FrameLease, meta: &FrameMeta) {
//!         println!("frame ts {} status {:?}", meta.timestamp, meta.status);
//!         drop(frame); // hand the buffer back
//!     }
//! }
//!
//! let clock = MonotonicClock::new();
//! let backend = Arc::new(UdpQueueBackend::new(vec!["0.0.0.0".parse().unwrap()], clock.clone()));
//! let mgr = RxVideoManager::new(ManagerConfig::new(backend, clock));
//! let sources = vec![PortSource { ip: "239.168.85.20".parse().unwrap(), udp_port: 20000 }];
//! let id = mgr.attach(RxOps::new("cam0", sources, Arc::new(App))).unwrap();
//! let sched = Scheduler::spawn(mgr.clone()).unwrap();
//! // ... stream runs ...
//! sched.stop();
//! mgr.detach(id).unwrap();
//! ```

pub mod clock;
pub mod detector;
pub mod dma;
pub mod ebu;
pub mod error;
pub mod fmt;
pub mod frame;
pub mod hdr_split;
pub mod manager;
pub mod ops;
pub mod queue;
pub mod rtcp;
pub mod rtp;
mod session;
pub mod slot;
pub mod stats;

pub use error::{Error, PktDropReason};
pub use fmt::{Fps, Packing, PixelFormat};
pub use manager::{ManagerConfig, RxVideoManager, Scheduler, SessionId};
pub use ops::{FrameMeta, FrameStatus, PortSource, RxFlags, RxOps, SessionEvents, SessionType};
