//! Slot state machine and ring primitives.
//!
//! The ring is a fixed-capacity circular buffer. Each slot walks through a
//! four-state cycle:
//!
//! ```text
//! Free --(producer reserves)--> BeingImported
//! BeingImported --(producer publishes)--> Ready
//! Ready --(consumer acquires)--> BeingExported
//! BeingExported --(consumer recycles)--> Free
//! ```
//!
//! Slot states, the head index, and the shutdown flag live behind one mutex;
//! a single condition variable is shared by space-waiting producers and the
//! message-waiting consumer. The payload cells live *outside* the mutex so
//! that materializing a message never holds the lock: a slot in
//! `BeingImported` is owned exclusively by the producer that reserved it, a
//! slot in `BeingExported` exclusively by the consumer, and every ownership
//! hand-off is a state transition made under the mutex.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::ShutdownMode;

/// Where a slot currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    BeingImported,
    Ready,
    BeingExported,
}

/// One cell of the ring buffer.
///
/// `value` is initialized exactly while the slot is `Ready` or has been
/// acquired but not yet read out; `index` is meaningful in the same window.
struct Slot<T> {
    index: UnsafeCell<u64>,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            index: UnsafeCell::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Everything the mutex protects.
struct Shared {
    states: Box<[SlotState]>,
    /// Next slot a producer will attempt to claim.
    head: usize,
    shutdown: bool,
}

/// Outcome of a reservation attempt.
pub(crate) enum Reserve {
    /// A slot was claimed together with the message's absolute index.
    Slot { slot: usize, index: u64 },
    /// The head slot was taken and the discard policy rejected the attempt.
    Full,
    /// The queue is shutting down.
    ShutDown,
}

/// The circular buffer shared by all producers and the consumer thread.
pub(crate) struct Ring<T> {
    shared: Mutex<Shared>,
    cond: Condvar,
    slots: Box<[Slot<T>]>,
    /// Count of push attempts that reached the point of claiming an absolute
    /// index, including rejected ones. Readable without the mutex.
    total_pushed: AtomicU64,
}

// SAFETY: the payload cells are only ever touched by a slot's current
// exclusive owner (the reserving producer while `BeingImported`, the consumer
// while `BeingExported`), and every ownership hand-off is a state transition
// under `shared`, which also provides the happens-before edges for the
// unsynchronized cell accesses.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates a ring with all slots free. Panics if `capacity` is zero.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        Self {
            shared: Mutex::new(Shared {
                states: vec![SlotState::Free; capacity].into_boxed_slice(),
                head: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            total_pushed: AtomicU64::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn total_pushed(&self) -> u64 {
        self.total_pushed.load(Ordering::Relaxed)
    }

    /// Number of slots not currently `Free`. Racy snapshot.
    pub(crate) fn occupied(&self) -> usize {
        self.lock()
            .states
            .iter()
            .filter(|state| **state != SlotState::Free)
            .count()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    // No user code ever runs while the mutex is held, so it cannot be
    // poisoned and lock acquisition is infallible in practice.
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    /// Claims the head slot for the calling producer. Caller holds the lock
    /// and has verified the slot is free.
    fn claim(&self, shared: &mut Shared) -> Reserve {
        let slot = shared.head;
        debug_assert_eq!(shared.states[slot], SlotState::Free);
        shared.states[slot] = SlotState::BeingImported;
        shared.head = (shared.head + 1) % self.slots.len();
        // Claiming the index inside the reservation critical section keeps
        // accepted indices increasing in slot order; rejected attempts also
        // consume an index, which is what lets the sink count gaps.
        let index = self.total_pushed.fetch_add(1, Ordering::Relaxed);
        Reserve::Slot { slot, index }
    }

    /// Reservation under the discard policy: never waits.
    pub(crate) fn try_reserve(&self) -> Reserve {
        let mut shared = self.lock();
        if shared.shutdown {
            self.total_pushed.fetch_add(1, Ordering::Relaxed);
            Reserve::ShutDown
        } else if shared.states[shared.head] == SlotState::Free {
            self.claim(&mut shared)
        } else {
            self.total_pushed.fetch_add(1, Ordering::Relaxed);
            Reserve::Full
        }
    }

    /// Reservation under the block policy: waits for the head slot to free
    /// up, or for shutdown. Which of several waiting producers obtains a
    /// freed slot is unspecified.
    pub(crate) fn reserve_blocking(&self) -> Reserve {
        let mut shared = self.lock();
        loop {
            if shared.shutdown {
                self.total_pushed.fetch_add(1, Ordering::Relaxed);
                return Reserve::ShutDown;
            }
            // `head` can move while this producer sleeps; re-read both.
            if shared.states[shared.head] == SlotState::Free {
                return self.claim(&mut shared);
            }
            shared = self.cond.wait(shared).unwrap();
        }
    }

    /// Marks a reserved slot ready for the consumer.
    pub(crate) fn publish(&self, slot: usize) {
        {
            let mut shared = self.lock();
            debug_assert_eq!(shared.states[slot], SlotState::BeingImported);
            shared.states[slot] = SlotState::Ready;
        }
        self.cond.notify_all();
    }

    /// Returns a reserved slot to `Free` without publishing anything. Used
    /// when materialization fails so the ring cannot wedge on a slot stuck
    /// in `BeingImported`.
    pub(crate) fn abort(&self, slot: usize) {
        {
            let mut shared = self.lock();
            debug_assert_eq!(shared.states[slot], SlotState::BeingImported);
            shared.states[slot] = SlotState::Free;
        }
        self.cond.notify_all();
    }

    /// Consumer side: waits until the tail slot is `Ready` (then moves it to
    /// `BeingExported` and returns `true`) or until shutdown ends the loop
    /// (returns `false`).
    ///
    /// Under [`ShutdownMode::Immediate`] the flag wins even if the tail slot
    /// is already `Ready`; under [`ShutdownMode::Drain`] ready slots keep
    /// flowing and the loop ends at the first slot that is not.
    pub(crate) fn acquire(&self, tail: usize, mode: ShutdownMode) -> bool {
        let mut shared = self.lock();
        loop {
            let ready = shared.states[tail] == SlotState::Ready;
            if shared.shutdown && (mode == ShutdownMode::Immediate || !ready) {
                return false;
            }
            if ready {
                shared.states[tail] = SlotState::BeingExported;
                return true;
            }
            shared = self.cond.wait(shared).unwrap();
        }
    }

    /// Consumer side: frees the tail slot after dispatch and wakes a single
    /// waiter. Only space-waiting producers depend on this transition, and
    /// the consumer itself is the caller, so one wake-up suffices.
    pub(crate) fn recycle(&self, tail: usize) {
        {
            let mut shared = self.lock();
            debug_assert_eq!(shared.states[tail], SlotState::BeingExported);
            shared.states[tail] = SlotState::Free;
        }
        self.cond.notify_one();
    }

    /// Sets the shutdown flag and wakes everyone. Returns `true` the first
    /// time, `false` on repeat calls.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let newly_set = {
            let mut shared = self.lock();
            !std::mem::replace(&mut shared.shutdown, true)
        };
        self.cond.notify_all();
        newly_set
    }

    /// Writes the absolute index and the payload into a reserved slot.
    ///
    /// # Safety
    ///
    /// `slot` must be in `BeingImported` and owned by the caller, which is
    /// guaranteed for a slot obtained from [`Reserve::Slot`] that has not
    /// yet been published or aborted.
    pub(crate) unsafe fn fill(&self, slot: usize, index: u64, value: T) {
        let cell = &self.slots[slot];
        unsafe {
            *cell.index.get() = index;
            (*cell.value.get()).write(value);
        }
    }

    /// Moves the absolute index and the payload out of an acquired slot.
    ///
    /// # Safety
    ///
    /// `slot` must be in `BeingExported` and owned by the caller; each
    /// acquisition permits exactly one `take`.
    pub(crate) unsafe fn take(&self, slot: usize) -> (u64, T) {
        let cell = &self.slots[slot];
        unsafe { (*cell.index.get(), (*cell.value.get()).assume_init_read()) }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Exclusive access at this point. Slots still `Ready` hold payloads
        // that were published but never dispatched; every other state holds
        // none by the ownership protocol.
        let shared = self.shared.get_mut().unwrap();
        for (slot, state) in shared.states.iter().enumerate() {
            if *state == SlotState::Ready {
                // SAFETY: `Ready` means a producer fully materialized the
                // payload and nobody has moved it out since.
                unsafe { (*self.slots[slot].value.get()).assume_init_drop() };
            }
        }
    }
}

/// Frees a reserved slot if message materialization unwinds, so a panicking
/// payload factory cannot leave the slot stuck in `BeingImported`.
pub(crate) struct AbortOnUnwind<'a, T> {
    pub(crate) ring: &'a Ring<T>,
    pub(crate) slot: usize,
}

impl<T> Drop for AbortOnUnwind<'_, T> {
    fn drop(&mut self) {
        self.ring.abort(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved(outcome: Reserve) -> (usize, u64) {
        match outcome {
            Reserve::Slot { slot, index } => (slot, index),
            Reserve::Full => panic!("unexpected Full"),
            Reserve::ShutDown => panic!("unexpected ShutDown"),
        }
    }

    #[test]
    fn slot_walks_the_full_cycle() {
        let ring: Ring<&str> = Ring::new(2);

        let (slot, index) = reserved(ring.try_reserve());
        assert_eq!((slot, index), (0, 0));
        assert_eq!(ring.occupied(), 1);

        unsafe { ring.fill(slot, index, "a") };
        ring.publish(slot);

        assert!(ring.acquire(0, ShutdownMode::Immediate));
        assert_eq!(unsafe { ring.take(0) }, (0, "a"));
        ring.recycle(0);

        assert_eq!(ring.occupied(), 0);
        assert_eq!(ring.total_pushed(), 1);
    }

    #[test]
    fn try_reserve_reports_full_and_still_counts() {
        let ring: Ring<u32> = Ring::new(1);

        let (slot, index) = reserved(ring.try_reserve());
        assert!(matches!(ring.try_reserve(), Reserve::Full));
        // The rejected attempt consumed an index too.
        assert_eq!(ring.total_pushed(), 2);

        unsafe { ring.fill(slot, index, 7) };
        ring.publish(slot);
        assert!(ring.acquire(0, ShutdownMode::Immediate));
        assert_eq!(unsafe { ring.take(0) }, (0, 7));
        ring.recycle(0);

        // The freed slot is reusable and the next accepted index skips the gap.
        let (slot, index) = reserved(ring.try_reserve());
        assert_eq!((slot, index), (0, 2));
        unsafe { ring.fill(slot, index, 8) };
        ring.publish(slot);
        assert!(ring.acquire(0, ShutdownMode::Immediate));
        assert_eq!(unsafe { ring.take(0) }, (2, 8));
        ring.recycle(0);
    }

    #[test]
    fn abort_returns_the_slot() {
        let ring: Ring<String> = Ring::new(1);

        let (slot, _) = reserved(ring.try_reserve());
        ring.abort(slot);
        assert_eq!(ring.occupied(), 0);

        let (slot, index) = reserved(ring.try_reserve());
        assert_eq!((slot, index), (0, 1));
        ring.abort(slot);
    }

    #[test]
    fn shutdown_rejects_reservations() {
        let ring: Ring<u8> = Ring::new(4);

        assert!(ring.begin_shutdown());
        assert!(!ring.begin_shutdown());
        assert!(ring.is_shut_down());

        assert!(matches!(ring.try_reserve(), Reserve::ShutDown));
        assert!(matches!(ring.reserve_blocking(), Reserve::ShutDown));
        assert_eq!(ring.total_pushed(), 2);
    }

    #[test]
    fn head_wraps_around() {
        let ring: Ring<usize> = Ring::new(2);

        for round in 0..3u64 {
            for offset in 0..2usize {
                let (slot, index) = reserved(ring.try_reserve());
                assert_eq!(slot, offset);
                assert_eq!(index, round * 2 + offset as u64);
                unsafe { ring.fill(slot, index, slot) };
                ring.publish(slot);
            }
            for offset in 0..2usize {
                assert!(ring.acquire(offset, ShutdownMode::Immediate));
                let (_, value) = unsafe { ring.take(offset) };
                assert_eq!(value, offset);
                ring.recycle(offset);
            }
        }
    }

    #[test]
    fn shutdown_modes_disagree_about_ready_slots() {
        let ring: Ring<&str> = Ring::new(2);

        let (slot, index) = reserved(ring.try_reserve());
        unsafe { ring.fill(slot, index, "queued") };
        ring.publish(slot);
        ring.begin_shutdown();

        // Immediate: the flag wins even though the tail slot is ready.
        assert!(!ring.acquire(0, ShutdownMode::Immediate));

        // Drain: the ready slot still flows, the empty one ends the loop.
        assert!(ring.acquire(0, ShutdownMode::Drain));
        assert_eq!(unsafe { ring.take(0) }, (0, "queued"));
        ring.recycle(0);
        assert!(!ring.acquire(1, ShutdownMode::Drain));
    }

    #[test]
    fn dropping_the_ring_releases_published_payloads() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Token(Arc<AtomicUsize>);
        impl Drop for Token {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let ring: Ring<Token> = Ring::new(4);
            for _ in 0..3 {
                let (slot, index) = reserved(ring.try_reserve());
                unsafe { ring.fill(slot, index, Token(Arc::clone(&drops))) };
                ring.publish(slot);
            }
            // One payload is consumed, two stay published.
            assert!(ring.acquire(0, ShutdownMode::Immediate));
            drop(unsafe { ring.take(0) });
            ring.recycle(0);
            assert_eq!(drops.load(Ordering::Relaxed), 1);
        }
        assert_eq!(drops.load(Ordering::Relaxed), 3);
    }
}
