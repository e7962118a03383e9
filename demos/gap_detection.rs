//! Discard policy under a slow consumer: the sink counts the messages it
//! never saw from the jumps in the absolute index.

use nimble_mpsc::{Builder, IndexedFn, OverflowPolicy, ShutdownMode};
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let queue = Builder::new()
        .capacity(8)
        .overflow_policy(OverflowPolicy::Discard)
        .shutdown_mode(ShutdownMode::Drain)
        .build(IndexedFn({
            let mut expected = 0u64;
            move |message: String, index: u64| {
                if index != expected {
                    println!("   ...{} message(s) discarded...", index - expected);
                }
                expected = index + 1;
                println!("processing {message}");
                thread::sleep(Duration::from_millis(20));
            }
        }));

    let mut accepted = 0;
    let mut discarded = 0;
    for burst in 0..10 {
        for i in 0..10 {
            match queue.push(format!("burst {burst} item {i}")) {
                Ok(()) => accepted += 1,
                Err(_) => discarded += 1,
            }
        }
        thread::sleep(Duration::from_millis(40));
    }

    println!("producer done: accepted {accepted}, discarded {discarded}");
    // Drain mode lets the queued remainder flush before the drop returns.
}
