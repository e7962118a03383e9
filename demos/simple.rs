//! Single producer feeding a printing sink.

use nimble_mpsc::Queue;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let queue = Queue::new(
        |message: String, index: u64, total: u64| {
            println!("received #{index}: {message} (pushed so far: {total})");
        },
        16,
    );

    for i in 0..10 {
        let message = format!("message {i}");
        println!("sending:  {message}");
        queue.push(message).unwrap();
        thread::sleep(Duration::from_millis(100));
    }
    // Dropping the queue shuts the consumer down and joins it.
}
