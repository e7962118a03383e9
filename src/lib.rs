//! nimble_mpsc — bounded in-memory MPSC queue with a dedicated consumer
//! thread.
//!
//! An efficient in-memory FIFO buffer built to keep producer threads blocked
//! for as short a time as possible: a producer reserves a ring slot under one
//! short critical section, materializes the message payload with no lock
//! held, and publishes the slot under a second short critical section. A
//! single consumer thread, spawned and owned by the queue, drains slots in
//! order and feeds each message to a user-supplied [`Sink`] together with two
//! counters (the message's absolute index and a snapshot of the push
//! counter).
//!
//! What happens when the ring is full is decided at construction time:
//!
//! - [`OverflowPolicy::Block`] (the default): `push` waits until the consumer
//!   frees a slot. When several producers are waiting, the order in which
//!   they obtain freed slots is unspecified; each individual producer's own
//!   messages still reach the sink in submission order.
//! - [`OverflowPolicy::Discard`]: `push` fails fast and hands the message
//!   back. Every attempt, accepted or not, consumes one absolute index, so
//!   the sink can count discarded messages from the gaps it observes.
//!
//! Dropping the queue signals shutdown, unblocks any waiting producers, and
//! joins the consumer thread.
//!
//! ```
//! use nimble_mpsc::Queue;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! let seen = Arc::new(AtomicU64::new(0));
//! let queue = Queue::new(
//!     {
//!         let seen = Arc::clone(&seen);
//!         move |n: u64, _index: u64, _total: u64| {
//!             seen.fetch_add(n, Ordering::Relaxed);
//!         }
//!     },
//!     64,
//! );
//!
//! for n in 1..=10 {
//!     queue.push(n).unwrap();
//! }
//! while seen.load(Ordering::Relaxed) != 55 {
//!     std::thread::yield_now();
//! }
//! ```

#![warn(missing_docs)]

mod error;
mod ring;
mod sink;

pub use error::PushError;
pub use sink::{IndexedFn, Sink};

use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, trace};

use ring::{AbortOnUnwind, Reserve, Ring};

/// Ring capacity used when [`Builder::capacity`] is not called.
pub const DEFAULT_CAPACITY: usize = 1024;

/// What `push` does when the slot at the head of the ring is not free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait until the consumer frees a slot, or until shutdown.
    #[default]
    Block,
    /// Reject the message immediately, handing it back to the caller.
    Discard,
}

/// How the consumer thread treats messages still queued when shutdown hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Exit as soon as the shutdown flag is observed, even if the next slot
    /// already holds a published message. A dispatch already in flight still
    /// completes and its slot is recycled.
    #[default]
    Immediate,
    /// Keep dispatching while the next slot holds a published message; exit
    /// at the first slot that does not.
    Drain,
}

/// Configures and constructs a [`Queue`].
///
/// ```
/// use nimble_mpsc::{Builder, OverflowPolicy};
///
/// let queue = Builder::new()
///     .capacity(256)
///     .overflow_policy(OverflowPolicy::Discard)
///     .build(|message: String, index: u64, _total: u64| {
///         println!("#{index}: {message}");
///     });
/// queue.push("hi".to_string()).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    capacity: usize,
    policy: OverflowPolicy,
    mode: ShutdownMode,
}

impl Builder {
    /// Starts from the defaults: [`DEFAULT_CAPACITY`], blocking overflow,
    /// immediate shutdown.
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            policy: OverflowPolicy::default(),
            mode: ShutdownMode::default(),
        }
    }

    /// Sets the ring capacity. Panics at [`build`](Self::build) time if zero.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Selects the overflow policy.
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Selects the shutdown mode.
    pub fn shutdown_mode(mut self, mode: ShutdownMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builds the queue and spawns its consumer thread, which owns `sink`
    /// from here on.
    pub fn build<T, S>(self, sink: S) -> Queue<T>
    where
        T: Send + 'static,
        S: Sink<T> + 'static,
    {
        let ring = Arc::new(Ring::new(self.capacity));
        let worker = {
            let ring = Arc::clone(&ring);
            let mode = self.mode;
            thread::Builder::new()
                .name("nimble-mpsc-consumer".to_string())
                .spawn(move || consumer_loop(&ring, sink, mode))
                .expect("failed to spawn consumer thread")
        };
        debug!(
            "queue started: capacity={}, policy={:?}, shutdown={:?}",
            self.capacity, self.policy, self.mode
        );
        Queue {
            ring,
            policy: self.policy,
            worker: Some(worker),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded MPSC queue dispatching to a consumer thread it owns.
///
/// Any number of threads may call [`push`](Self::push) /
/// [`push_with`](Self::push_with) through a shared reference; wrap the queue
/// in an [`Arc`] to hand producers an owned handle.
pub struct Queue<T> {
    ring: Arc<Ring<T>>,
    policy: OverflowPolicy,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Queue<T> {
    /// Creates a queue with the given sink and capacity, blocking overflow
    /// policy, and immediate shutdown. Panics if `capacity` is zero.
    pub fn new<S>(sink: S, capacity: usize) -> Self
    where
        S: Sink<T> + 'static,
    {
        Builder::new().capacity(capacity).build(sink)
    }
}

impl<T> Queue<T> {
    /// Submits a message by value.
    ///
    /// Blocks while the ring is full under [`OverflowPolicy::Block`]; fails
    /// fast with [`PushError::Full`] under [`OverflowPolicy::Discard`].
    /// After shutdown every call fails with [`PushError::ShutDown`]. A
    /// rejected message is handed back inside the error. Rejected attempts
    /// still advance [`total_pushed`](Self::total_pushed).
    pub fn push(&self, message: T) -> Result<(), PushError<T>> {
        match self.reserve() {
            Reserve::Slot { slot, index } => {
                // SAFETY: the slot is in `BeingImported` and owned by this
                // call until published.
                unsafe { self.ring.fill(slot, index, message) };
                self.ring.publish(slot);
                Ok(())
            }
            Reserve::Full => {
                trace!("message discarded, ring is full");
                Err(PushError::Full(message))
            }
            Reserve::ShutDown => Err(PushError::ShutDown(message)),
        }
    }

    /// Submits a message constructed in place.
    ///
    /// The factory runs only after a slot has been reserved, and strictly
    /// outside the queue's lock, so an expensive construction never stalls
    /// other producers or the consumer. On rejection the factory is handed
    /// back unused. If the factory panics, the reserved slot is released and
    /// waiters are woken before the panic propagates to the caller.
    pub fn push_with<F>(&self, factory: F) -> Result<(), PushError<F>>
    where
        F: FnOnce() -> T,
    {
        match self.reserve() {
            Reserve::Slot { slot, index } => {
                let guard = AbortOnUnwind {
                    ring: &*self.ring,
                    slot,
                };
                let message = factory();
                mem::forget(guard);
                // SAFETY: as in `push`; the guard is disarmed and the slot
                // is still `BeingImported` and ours.
                unsafe { self.ring.fill(slot, index, message) };
                self.ring.publish(slot);
                Ok(())
            }
            Reserve::Full => {
                trace!("message discarded, ring is full");
                Err(PushError::Full(factory))
            }
            Reserve::ShutDown => Err(PushError::ShutDown(factory)),
        }
    }

    fn reserve(&self) -> Reserve {
        match self.policy {
            OverflowPolicy::Block => self.ring.reserve_blocking(),
            OverflowPolicy::Discard => self.ring.try_reserve(),
        }
    }

    /// Ring capacity, fixed for the queue's lifetime.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of occupied ring slots. Racy snapshot.
    pub fn len(&self) -> usize {
        self.ring.occupied()
    }

    /// `true` when no slot is occupied. Racy snapshot.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of push attempts so far, accepted and rejected alike.
    pub fn total_pushed(&self) -> u64 {
        self.ring.total_pushed()
    }

    /// Triggers shutdown without waiting for the consumer to exit.
    ///
    /// Idempotent. Producers blocked on a full ring unblock with
    /// [`PushError::ShutDown`]; the consumer winds down according to the
    /// queue's [`ShutdownMode`]. Dropping the queue then joins the consumer.
    pub fn shutdown(&self) {
        if self.ring.begin_shutdown() {
            debug!("shutdown requested");
        }
    }

    /// `true` once shutdown has been triggered.
    pub fn is_shut_down(&self) -> bool {
        self.ring.is_shut_down()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(worker) = self.worker.take() {
            // A sink that panicked has already terminated the thread; the
            // messages it left behind are released with the ring.
            let _ = worker.join();
        }
    }
}

fn consumer_loop<T, S: Sink<T>>(ring: &Ring<T>, mut sink: S, mode: ShutdownMode) {
    trace!("consumer thread running");
    let mut tail = 0usize;
    while ring.acquire(tail, mode) {
        // SAFETY: `acquire` moved the slot to `BeingExported`; it is ours
        // exclusively until recycled, and read out exactly once.
        let (index, message) = unsafe { ring.take(tail) };
        sink.on_message(message, index, ring.total_pushed());
        ring.recycle(tail);
        tail = (tail + 1) % ring.capacity();
    }
    trace!("consumer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn builder_defaults() {
        let builder = Builder::new();
        assert_eq!(builder.capacity, DEFAULT_CAPACITY);
        assert_eq!(builder.policy, OverflowPolicy::Block);
        assert_eq!(builder.mode, ShutdownMode::Immediate);
    }

    #[test]
    fn push_reaches_the_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = Queue::new(
            {
                let seen = Arc::clone(&seen);
                move |n: u32, index: u64, total: u64| {
                    assert!(total > index);
                    seen.lock().unwrap().push((n, index));
                }
            },
            8,
        );

        for n in 0..5 {
            queue.push(n).unwrap();
        }
        while seen.lock().unwrap().len() != 5 {
            thread::yield_now();
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, 0), (1, 1), (2, 2), (3, 3), (4, 4)]
        );
        assert_eq!(queue.total_pushed(), 5);
    }

    #[test]
    fn push_after_shutdown_is_rejected_but_counted() {
        let dispatched = Arc::new(AtomicUsize::new(0));
        let queue = Queue::new(
            {
                let dispatched = Arc::clone(&dispatched);
                move |_: u8, _: u64, _: u64| {
                    dispatched.fetch_add(1, Ordering::SeqCst);
                }
            },
            4,
        );

        queue.shutdown();
        assert!(queue.is_shut_down());
        let err = queue.push(1).unwrap_err();
        assert!(err.is_shut_down());
        assert_eq!(err.into_inner(), 1);
        assert_eq!(queue.total_pushed(), 1);
        drop(queue);
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }
}
