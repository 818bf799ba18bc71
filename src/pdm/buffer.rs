//! Ring of fixed-size raw PDM slots shared between the capture hardware and the reader
//!
//! The hardware fills slots in order on its own clock and never waits. The reader picks one
//! completed slot per read. Writer and reader only share the cursor words below; every cursor is
//! written by exactly one side, using plain atomic loads and stores so the ring also works on cores
//! without read-modify-write atomics.
//!
//! The reader keeps a guard window of `g` slots from the writer. When it is about to be lapped it
//! jumps forward to the freshest slot, and when it has caught up with a faster writer it jumps back
//! to the deepest slot that is still safe. Nothing stops the writer from overtaking a slot that is
//! being decoded if the reader stalls for longer than the window covers; the window only makes this
//! unlikely.

use core::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::config::DriftPolicy;
use crate::dma::MAX_TRANSPORTS;
use crate::{Error, Resource};

/// Slot storage handed to the ring, which the transport writes behind the borrow checker's back
///
/// It must outlive every transfer the transport may still have in flight, so only `'static`
/// memory is accepted, e.g. from `cortex_m::singleton!` or a leaked `Box` on a host.
pub type SlotStorage = &'static mut [u8];

pub struct CaptureRing {
    storage: *mut u8,
    capacity: usize,
    slot_len: usize,
    slot_count: usize,
    transports: usize,
    /// Slot each transport is filling, or will fill next
    cursors: [AtomicUsize; MAX_TRANSPORTS],
    /// First slot not yet completed
    head: AtomicUsize,
    /// Next slot the reader expects
    read: AtomicUsize,
    /// Completed slots since the last reset, wrapping
    produced: AtomicUsize,
}

// The storage pointer comes from an exclusive 'static borrow. Writer and reader only exchange
// slots through the cursors, see the module documentation
unsafe impl Send for CaptureRing {}
unsafe impl Sync for CaptureRing {}

impl CaptureRing {
    pub fn new(storage: SlotStorage, slot_len: usize, slot_count: usize, transports: usize) -> Result<Self, Error> {
        let needed = slot_len * slot_count;
        if needed > storage.len() {
            return Err(Error::ResourceExhaustion(Resource::Storage { needed, available: storage.len() }));
        }
        if transports == 0 || transports > MAX_TRANSPORTS {
            return Err(Error::ResourceExhaustion(Resource::TransportChannel));
        }
        let ring = Self {
            capacity: storage.len(),
            storage: storage.as_mut_ptr(),
            slot_len,
            slot_count,
            transports,
            cursors: [AtomicUsize::new(0), AtomicUsize::new(0)],
            head: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            produced: AtomicUsize::new(0),
        };
        ring.reset();
        Ok(ring)
    }

    /// Rewind all cursors; transport `i` starts on slot `i`
    ///
    /// Must not race with [`CaptureRing::complete`].
    pub fn reset(&self) {
        for (i, cursor) in self.cursors.iter().enumerate() {
            cursor.store(i % self.slot_count, Ordering::Relaxed);
        }
        self.head.store(0, Ordering::Relaxed);
        self.read.store(0, Ordering::Relaxed);
        self.produced.store(0, Ordering::Release);
    }

    /// Bytes of storage handed to the ring
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn transports(&self) -> usize {
        self.transports
    }

    /// Location of slot `index`, for handing to a transport
    pub fn slot_ptr(&self, index: usize) -> *mut [u8] {
        let offset = (index % self.slot_count) * self.slot_len;
        core::ptr::slice_from_raw_parts_mut(self.storage.wrapping_add(offset), self.slot_len)
    }

    /// Run `f` on the contents of slot `index`
    ///
    /// Intended for slots returned by [`CaptureRing::acquire`], which are never the slot in flight.
    pub fn with_slot<R>(&self, index: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let slot = self.slot_ptr(index);
        // SAFETY: the slot lies within storage, and the writer is elsewhere in the ring as long as
        // the reader honours the guard window
        let data = unsafe { &*slot };
        f(data)
    }

    pub fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    pub fn read_cursor(&self) -> usize {
        self.read.load(Ordering::Acquire)
    }

    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::Acquire)
    }

    /// Completed slots the reader has not consumed
    pub fn lag(&self) -> usize {
        (self.head() + self.slot_count - self.read_cursor()) % self.slot_count
    }

    /// Slot transport `channel` fills next
    pub fn cursor(&self, channel: usize) -> usize {
        self.cursors[channel % self.transports].load(Ordering::Relaxed)
    }

    /// Mark the slot of transport `channel` complete and return the slot it should fill next
    ///
    /// Writer side only.
    pub fn complete(&self, channel: usize) -> usize {
        let cursor = &self.cursors[channel % self.transports];
        let slot = cursor.load(Ordering::Relaxed);
        let next = (slot + self.transports) % self.slot_count;
        cursor.store(next, Ordering::Relaxed);

        self.head.store((slot + 1) % self.slot_count, Ordering::Release);
        let produced = self.produced.load(Ordering::Relaxed);
        self.produced.store(produced.wrapping_add(1), Ordering::Release);
        next
    }

    /// Choose the slot to decode next, or `None` when nothing new has completed
    ///
    /// Reader side only. Pair with [`CaptureRing::release`] once the slot is decoded.
    pub fn acquire(&self, drift: &mut DriftCompensator) -> Option<usize> {
        let b = self.slot_count;
        let head = self.head.load(Ordering::Acquire);
        let produced = self.produced.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Relaxed);

        let lag = (head + b - read) % b;
        if lag == 0 {
            return None;
        }
        drift.reads = drift.reads.wrapping_add(1);

        // Signed distance from reader to writer, in [-b/2, b/2)
        let d = if lag >= (b + 1) / 2 { lag as isize - b as isize } else { lag as isize };
        let g = drift.guard as isize;
        let faster = drift.consumer_faster(produced);
        let lapped = d < 0 && d >= -g;
        let starving = faster && d > 0 && d <= g;

        if lapped || starving {
            let target = if faster { b.saturating_sub(drift.guard + 1).max(1) } else { 1 };
            // A target further back than anything written would read a slot that was never filled
            if produced >= target {
                let slot = (head + b - target) % b;
                debug!("PDM reader rebased from slot {} (lag {}) to slot {} (lag {})", read, lag, slot, target);
                drift.rebased(produced);
                return Some(slot);
            }
        }
        Some(read)
    }

    /// Mark `slot` consumed; the reader continues after it
    pub fn release(&self, slot: usize) {
        self.read.store((slot + 1) % self.slot_count, Ordering::Release);
    }
}

/// Reader-side bookkeeping for the guard window
#[derive(Clone, Debug)]
pub struct DriftCompensator {
    policy: DriftPolicy,
    guard: usize,
    /// Slots selected since the last rebase; empty polls do not count
    reads: usize,
    /// `produced` as of the last rebase
    produced_mark: usize,
    rebases: usize,
}

impl DriftCompensator {
    pub fn new(policy: DriftPolicy, guard: usize) -> Self {
        Self { policy, guard, reads: 0, produced_mark: 0, rebases: 0 }
    }

    pub fn policy(&self) -> DriftPolicy {
        self.policy
    }

    pub fn guard(&self) -> usize {
        self.guard
    }

    /// Number of times the reader has been moved
    pub fn rebases(&self) -> usize {
        self.rebases
    }

    /// Forget all measurements, as at the start of capture
    pub fn reset(&mut self) {
        self.reads = 0;
        self.produced_mark = 0;
        self.rebases = 0;
    }

    fn consumer_faster(&self, produced: usize) -> bool {
        match self.policy {
            DriftPolicy::ConsumerSlower => false,
            DriftPolicy::ConsumerFaster => true,
            DriftPolicy::Measured => self.reads > produced.wrapping_sub(self.produced_mark),
        }
    }

    fn rebased(&mut self, produced: usize) {
        self.reads = 0;
        self.produced_mark = produced;
        self.rebases = self.rebases.wrapping_add(1);
    }
}
