//! DMA lender contract.
//!
//! The session borrows a lender from an external engine and enqueues copy
//! descriptors instead of touching the framebuffer itself. A borrowed mbuf
//! moves into the lender's queue and is released by the completion drain,
//! so it cannot be freed twice. The in-tree [`SoftDma`] defers the actual
//! copies until the drain, which models in-flight descriptors faithfully
//! enough for back-pressure behavior without real hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::frame::FrameBuffer;
use crate::queue::Mbuf;

/// Descriptor-ring request handed to the engine.
#[derive(Debug, Clone)]
pub struct DmaRequest {
    pub nb_desc: u16,
    /// How many sessions may share the underlying engine.
    pub max_shared: u16,
}

pub trait DmaProvider: Send + Sync {
    fn request(&self, req: &DmaRequest) -> Option<Box<dyn DmaLender>>;
}

pub trait DmaLender: Send {
    /// Enqueue one copy into the frame. `Err` when the descriptor ring is
    /// full or the engine rejects the transfer.
    fn copy(&mut self, dst: &Arc<FrameBuffer>, offset: usize, src: Bytes) -> Result<(), ()>;

    /// Move the mbuf whose payload the last `copy` references into the
    /// lender queue, tagged with its destination range.
    fn borrow_mbuf(&mut self, mbuf: Mbuf, offset: u32, len: u32);

    /// Kick enqueued descriptors toward the engine.
    fn submit(&mut self);

    /// Drain up to `max` retired descriptors. `on_drop` sees the tag of
    /// every released mbuf (the slice path tracks coverage through it).
    fn completed(&mut self, max: usize, on_drop: Option<&mut dyn FnMut(u32, u32)>) -> usize;

    fn empty(&self) -> bool;

    fn full(&self) -> bool;

    fn inflight(&self) -> usize;
}

struct Desc {
    frame: Arc<FrameBuffer>,
    offset: usize,
    src: Bytes,
    mbuf: Option<Mbuf>,
    tag: (u32, u32),
    submitted: bool,
}

/// Software lender: copies land when the descriptor retires at drain time.
pub struct SoftDma {
    nb_desc: usize,
    pending: VecDeque<Desc>,
    hold: Arc<AtomicBool>,
}

impl SoftDma {
    pub fn new(nb_desc: usize, hold: Arc<AtomicBool>) -> Self {
        Self { nb_desc, pending: VecDeque::new(), hold }
    }
}

impl DmaLender for SoftDma {
    fn copy(&mut self, dst: &Arc<FrameBuffer>, offset: usize, src: Bytes) -> Result<(), ()> {
        if self.full() {
            return Err(());
        }
        self.pending.push_back(Desc {
            frame: dst.clone(),
            offset,
            src,
            mbuf: None,
            tag: (0, 0),
            submitted: false,
        });
        Ok(())
    }

    fn borrow_mbuf(&mut self, mbuf: Mbuf, offset: u32, len: u32) {
        if let Some(desc) = self.pending.back_mut() {
            desc.mbuf = Some(mbuf);
            desc.tag = (offset, len);
        }
    }

    fn submit(&mut self) {
        for desc in self.pending.iter_mut() {
            desc.submitted = true;
        }
    }

    fn completed(&mut self, max: usize, mut on_drop: Option<&mut dyn FnMut(u32, u32)>) -> usize {
        if self.hold.load(Ordering::Acquire) {
            return 0;
        }
        let mut done = 0;
        while done < max {
            match self.pending.front() {
                Some(desc) if desc.submitted => {}
                _ => break,
            }
            let desc = self.pending.pop_front().expect("checked front");
            desc.frame.write(desc.offset, &desc.src);
            if desc.mbuf.is_some() {
                if let Some(cb) = on_drop.as_deref_mut() {
                    cb(desc.tag.0, desc.tag.1);
                }
            }
            done += 1;
        }
        done
    }

    fn empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn full(&self) -> bool {
        self.pending.len() >= self.nb_desc
    }

    fn inflight(&self) -> usize {
        self.pending.len()
    }
}

/// Provider for the software lender. `set_hold(true)` freezes completion
/// drains, which is how back-pressure gets exercised without hardware.
pub struct SoftDmaProvider {
    hold: Arc<AtomicBool>,
}

impl SoftDmaProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { hold: Arc::new(AtomicBool::new(false)) })
    }

    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::Release);
    }
}

impl DmaProvider for SoftDmaProvider {
    fn request(&self, req: &DmaRequest) -> Option<Box<dyn DmaLender>> {
        Some(Box::new(SoftDma::new(req.nb_desc as usize, self.hold.clone())))
    }
}
