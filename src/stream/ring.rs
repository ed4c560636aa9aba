//! Single-writer, many-cursor unit ring
//!
//! Fixed-capacity ring of media units with drop-on-overflow semantics.
//! The writer never stalls: when a cursor lags by more than the capacity,
//! the cursor's oldest unread units are logically discarded and the lag is
//! reported as an overflow on that cursor's next read.
//!
//! The slot array length is a power of two. The writer publishes a 64-bit
//! monotone sequence with release ordering; cursors compare their own
//! next-expected sequence against it to detect both "nothing new" and
//! overflow.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

use super::StreamError;
use crate::media::Unit;

/// Sentinel stored in unwritten slots; never a valid sequence
const SEQ_UNSET: u64 = u64::MAX;

struct Slot {
    /// Sequence of the unit currently stored, `SEQ_UNSET` before first write
    seq: AtomicU64,
    unit: RwLock<Option<Arc<Unit>>>,
}

/// Bounded ring shared by one writer and any number of cursors
pub struct UnitRing {
    slots: Box<[Slot]>,
    mask: u64,
    /// Next sequence to be written; units `< write_seq` have been published
    write_seq: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl UnitRing {
    /// Create a ring; `capacity` is rounded up to the next power of two
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();

        let slots = (0..capacity)
            .map(|_| Slot {
                seq: AtomicU64::new(SEQ_UNSET),
                unit: RwLock::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            mask: (capacity - 1) as u64,
            slots,
            write_seq: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Effective capacity (power of two)
    pub fn capacity(&self) -> u64 {
        self.mask + 1
    }

    /// Sequence of the next unit to be written
    pub fn writer_seq(&self) -> u64 {
        self.write_seq.load(Ordering::Acquire)
    }

    /// Push a unit. Never blocks on readers; fails only after [`close`].
    ///
    /// [`close`]: UnitRing::close
    pub fn push(&self, unit: Arc<Unit>) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Detached);
        }

        let seq = self.write_seq.load(Ordering::Relaxed);
        let slot = &self.slots[(seq & self.mask) as usize];

        *slot.unit.write() = Some(unit);
        slot.seq.store(seq, Ordering::Release);

        self.write_seq.store(seq + 1, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Create a cursor positioned at the current writer sequence.
    ///
    /// The cursor observes only units pushed after this call (no replay).
    pub fn cursor(self: &Arc<Self>) -> RingCursor {
        RingCursor {
            next: self.writer_seq(),
            ring: Arc::clone(self),
        }
    }

    /// Detach the ring: pushes fail, cursors drain what is left and then
    /// observe [`StreamError::Detached`]. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the ring has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Independent read position inside a [`UnitRing`]
pub struct RingCursor {
    ring: Arc<UnitRing>,
    /// Next-expected sequence
    next: u64,
}

impl RingCursor {
    /// Number of published units this cursor has not yet read
    pub fn lag(&self) -> u64 {
        self.ring.writer_seq().saturating_sub(self.next)
    }

    /// Read the next unit in producer order.
    ///
    /// Waits while the cursor has caught up with the writer. If the writer
    /// lapped this cursor, reports [`StreamError::Overflow`] exactly once
    /// and fast-forwards to the oldest unit still held, so the following
    /// read resumes with a gap. Returns [`StreamError::Detached`] once the
    /// ring is closed and fully drained.
    pub async fn pull(&mut self) -> Result<Arc<Unit>, StreamError> {
        loop {
            // The notified future must be created before the sequence check,
            // otherwise a push between check and await is lost.
            let notified = self.ring.notify.notified();

            let writer = self.ring.writer_seq();
            if self.next == writer {
                if self.ring.is_closed() {
                    return Err(StreamError::Detached);
                }
                notified.await;
                continue;
            }

            let lag = writer - self.next;
            let capacity = self.ring.capacity();
            if lag > capacity {
                let skipped = lag - capacity;
                self.next = writer - capacity;
                return Err(StreamError::Overflow { skipped });
            }

            let slot = &self.ring.slots[(self.next & self.ring.mask) as usize];
            let guard = slot.unit.read();
            if slot.seq.load(Ordering::Acquire) != self.next {
                // The writer reused this slot between the lag check and the
                // read; re-evaluate, which lands in the overflow branch.
                drop(guard);
                continue;
            }

            let unit = guard.clone();
            drop(guard);

            match unit {
                Some(unit) => {
                    self.next += 1;
                    return Ok(unit);
                }
                None => return Err(StreamError::Detached),
            }
        }
    }
}
