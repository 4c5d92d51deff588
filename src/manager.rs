//! Session manager: a set of receive sessions serviced by one scheduler
//! thread through two cooperative tasklets.
//!
//! `pkt_rx` bursts packets for every session and reports whether anything
//! happened, which lets the scheduler sleep on idle links. `control` handles
//! the slow work: vsync, NACK emission, busy scores, statistics. Attach,
//! detach and source updates serialize against the tasklets through the
//! per-slot locks.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::dma::DmaProvider;
use crate::error::Error;
use crate::ops::{PortSource, RxOps};
use crate::queue::{Mbuf, QueueBackend};
use crate::session::{Session, SessionDeps};
use crate::stats::PortStatsSnapshot;

/// Default cap on sessions per manager.
pub const DEFAULT_MAX_SESSIONS: usize = 32;
/// Scheduler sleep when no session advertises a hint.
const DEFAULT_SLEEP_US: u64 = 200;

pub struct ManagerConfig {
    pub backend: Arc<dyn QueueBackend>,
    pub clock: Arc<dyn Clock>,
    pub dma: Option<Arc<dyn DmaProvider>>,
    /// PA-IOVA hugepage size; enables per-frame page tables.
    pub dma_page_size: Option<usize>,
    pub max_sessions: usize,
}

impl ManagerConfig {
    pub fn new(backend: Arc<dyn QueueBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            dma: None,
            dma_page_size: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Session handle: slot index plus a generation so a stale handle can never
/// reach a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId {
    idx: usize,
    gen: u32,
}

impl SessionId {
    pub fn index(&self) -> usize {
        self.idx
    }
}

struct SessionSlot {
    gen: u32,
    session: Option<Session>,
}

pub struct RxVideoManager {
    deps: SessionDeps,
    slots: Vec<Mutex<SessionSlot>>,
    max_idx: AtomicUsize,
    sleep_hint_us: AtomicU64,
}

impl RxVideoManager {
    pub fn new(cfg: ManagerConfig) -> Arc<Self> {
        let deps = SessionDeps {
            backend: cfg.backend,
            dma: cfg.dma,
            clock: cfg.clock,
            dma_page_size: cfg.dma_page_size,
        };
        Arc::new(Self {
            deps,
            slots: (0..cfg.max_sessions)
                .map(|_| Mutex::new(SessionSlot { gen: 0, session: None }))
                .collect(),
            max_idx: AtomicUsize::new(0),
            sleep_hint_us: AtomicU64::new(DEFAULT_SLEEP_US),
        })
    }

    /// Bind a new session. All-or-nothing: on error no resource is left
    /// behind and no slot is consumed.
    pub fn attach(&self, ops: RxOps) -> Result<SessionId, Error> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock();
            if guard.session.is_some() {
                continue;
            }
            let session = Session::attach(idx, ops, self.deps.clone())?;
            guard.gen += 1;
            let id = SessionId { idx, gen: guard.gen };
            guard.session = Some(session);
            self.max_idx.fetch_max(idx + 1, Ordering::AcqRel);
            self.update_sleep_hint();
            info!("manager: session {} attached", idx);
            return Ok(id);
        }
        Err(Error::NoSessionSlot)
    }

    pub fn detach(&self, id: SessionId) -> Result<(), Error> {
        let mut guard = self.slots.get(id.idx).ok_or(Error::UnknownSession(id.idx))?.lock();
        if guard.gen != id.gen || guard.session.is_none() {
            return Err(Error::UnknownSession(id.idx));
        }
        if let Some(mut s) = guard.session.take() {
            s.detach();
        }
        drop(guard);
        self.update_sleep_hint();
        info!("manager: session {} detached", id.idx);
        Ok(())
    }

    /// Redirect a running session to new source addresses.
    pub fn update_source(&self, id: SessionId, sources: Vec<PortSource>) -> Result<(), Error> {
        self.with_session(id, |s| s.update_source(sources))?
    }

    fn with_session<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, Error> {
        let mut guard = self.slots.get(id.idx).ok_or(Error::UnknownSession(id.idx))?.lock();
        if guard.gen != id.gen {
            return Err(Error::UnknownSession(id.idx));
        }
        match guard.session.as_mut() {
            Some(s) => Ok(f(s)),
            None => Err(Error::UnknownSession(id.idx)),
        }
    }

    /// Packet-rx tasklet: one burst round over every session. Returns true
    /// when any session produced work.
    pub fn poll_pkt_rx(&self) -> bool {
        let mut busy = false;
        let max = self.max_idx.load(Ordering::Acquire);
        for slot in self.slots.iter().take(max) {
            // never stall the data path on an attach in progress
            let mut guard = match slot.try_lock() {
                Some(g) => g,
                None => continue,
            };
            if let Some(s) = guard.session.as_mut() {
                busy |= s.poll_rx();
            }
        }
        busy
    }

    /// Control tasklet: vsync, NACKs, busy scores, stats.
    pub fn poll_control(&self) {
        let max = self.max_idx.load(Ordering::Acquire);
        for slot in self.slots.iter().take(max) {
            let mut guard = match slot.try_lock() {
                Some(g) => g,
                None => continue,
            };
            if let Some(s) = guard.session.as_mut() {
                s.poll_control();
            }
        }
    }

    fn update_sleep_hint(&self) {
        let mut hint = DEFAULT_SLEEP_US;
        for slot in self.slots.iter() {
            if let Some(guard) = slot.try_lock() {
                if let Some(s) = guard.session.as_ref() {
                    if s.advice_sleep_us > 0 {
                        hint = hint.min(s.advice_sleep_us);
                    }
                }
            }
        }
        self.sleep_hint_us.store(hint, Ordering::Release);
    }

    pub fn sleep_hint_us(&self) -> u64 {
        self.sleep_hint_us.load(Ordering::Acquire)
    }

    /// RTP passthrough: pop one packet from the session's ring.
    pub fn dequeue_rtp(&self, id: SessionId) -> Result<Option<Mbuf>, Error> {
        self.with_session(id, |s| s.dequeue_rtp())
    }

    pub fn port_stats(&self, id: SessionId, port: usize) -> Result<PortStatsSnapshot, Error> {
        self.with_session(id, |s| {
            s.port_stats_snapshot(port).ok_or(Error::InvalidOps("port out of range"))
        })?
    }

    pub fn reset_port_stats(&self, id: SessionId, port: usize) -> Result<(), Error> {
        self.with_session(id, |s| s.reset_port_stats(port))
    }

    pub fn framebuffer_size(&self, id: SessionId) -> Result<usize, Error> {
        self.with_session(id, |s| s.framebuffer_size())
    }

    pub fn framebuffer_count(&self, id: SessionId) -> Result<usize, Error> {
        self.with_session(id, |s| s.framebuffer_count())
    }

    pub fn session_count(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().session.is_some()).count()
    }
}

impl Drop for RxVideoManager {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let mut guard = slot.lock();
            if let Some(mut s) = guard.session.take() {
                warn!("manager: session {} still attached at shutdown", s.idx);
                s.detach();
            }
        }
    }
}

/// Dedicated scheduler thread driving both tasklets cooperatively.
pub struct Scheduler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(mgr: Arc<RxVideoManager>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new().name("st-rx-sched".into()).spawn(move || {
            info!("scheduler: up");
            while !thread_stop.load(Ordering::Acquire) {
                let busy = mgr.poll_pkt_rx();
                mgr.poll_control();
                if !busy {
                    std::thread::sleep(Duration::from_micros(mgr.sleep_hint_us()));
                }
            }
            info!("scheduler: down");
        })?;
        Ok(Self { stop, handle: Some(handle) })
    }

    /// Finish the current pass and stop.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
