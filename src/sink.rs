//! The consumer-side contract.

/// Receives every dispatched message.
///
/// The queue's consumer thread owns the sink and calls it for one message at
/// a time, strictly in increasing absolute-index order, so implementations
/// need no internal synchronization. A sink that blocks stalls the queue —
/// that is the backpressure mechanism, not a bug.
///
/// Any `FnMut(T, u64, u64) + Send` closure is a sink; implement the trait
/// directly when the sink carries its own state, or wrap a two-argument
/// closure in [`IndexedFn`] if the push counter is of no interest.
pub trait Sink<T>: Send {
    /// Called once per accepted message.
    ///
    /// `index` is the message's absolute index: the value of the push
    /// counter when its slot was reserved. Under the discard overflow policy
    /// rejected messages consume indices too, so a jump in `index` tells the
    /// sink exactly how many messages were discarded before this one.
    /// `total_pushed` is a snapshot of the push counter taken at dispatch
    /// time; comparing it against `index` shows how far production has run
    /// ahead of consumption.
    fn on_message(&mut self, message: T, index: u64, total_pushed: u64);
}

impl<T, F> Sink<T> for F
where
    F: FnMut(T, u64, u64) + Send,
{
    fn on_message(&mut self, message: T, index: u64, total_pushed: u64) {
        self(message, index, total_pushed)
    }
}

/// Adapter for sinks that only want the message and its absolute index.
///
/// ```
/// use nimble_mpsc::{IndexedFn, Queue};
///
/// let queue = Queue::new(
///     IndexedFn(|message: String, index: u64| println!("#{index}: {message}")),
///     16,
/// );
/// queue.push("hello".to_string()).unwrap();
/// ```
pub struct IndexedFn<F>(pub F);

impl<T, F> Sink<T> for IndexedFn<F>
where
    F: FnMut(T, u64) + Send,
{
    fn on_message(&mut self, message: T, index: u64, _total_pushed: u64) {
        (self.0)(message, index)
    }
}
