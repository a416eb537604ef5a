//! End-to-end frame queue scenarios: close semantics under contention and
//! multi-producer delivery through the public API.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framegrab::FrameQueue;

#[test]
fn close_unblocks_a_parked_consumer_within_100ms() {
    let queue: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new());
    let consumer_queue = Arc::clone(&queue);

    let consumer = std::thread::spawn(move || consumer_queue.pop());

    // Let the consumer actually park on the empty queue first.
    std::thread::sleep(Duration::from_millis(30));

    let closed_at = Instant::now();
    queue.close();
    let sentinel = consumer.join().expect("consumer thread must not panic");

    assert!(
        closed_at.elapsed() < Duration::from_millis(100),
        "blocked pop must return within 100ms of close"
    );
    assert_eq!(sentinel, 0, "closed + empty pop yields the sentinel");

    // After close, pushes are silently discarded.
    queue.push(2);
    assert_eq!(queue.try_pop(), None);
    assert!(queue.is_closed());
}

#[test]
fn four_producers_of_disjoint_ranges_deliver_exactly_400_values() {
    let queue: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new());

    let producers: Vec<_> = (0..4u32)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..100 {
                    queue.push(producer * 1000 + i);
                }
            })
        })
        .collect();

    // Consume concurrently with production.
    let consumer = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || {
            let mut seen = Vec::with_capacity(400);
            while seen.len() < 400 {
                if let Some(v) = queue.pop_timeout(Duration::from_secs(5)) {
                    seen.push(v);
                } else {
                    break;
                }
            }
            seen
        })
    };

    for producer in producers {
        producer.join().expect("producer must not panic");
    }
    let seen = consumer.join().expect("consumer must not panic");

    let distinct: BTreeSet<u32> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 400);
    assert_eq!(distinct.len(), 400, "every value observed exactly once");

    // Order within each producer's sequence is preserved; inter-producer
    // interleaving is unspecified.
    for producer in 0..4u32 {
        let of_producer: Vec<u32> = seen
            .iter()
            .copied()
            .filter(|v| v / 1000 == producer)
            .collect();
        let mut sorted = of_producer.clone();
        sorted.sort_unstable();
        assert_eq!(of_producer, sorted);
    }
}

#[test]
fn timed_pop_returns_absent_after_deadline_and_value_when_fed() {
    let queue: Arc<FrameQueue<u64>> = Arc::new(FrameQueue::new());

    assert_eq!(queue.pop_timeout(Duration::from_millis(10)), None);

    let feeder_queue = Arc::clone(&queue);
    let feeder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        feeder_queue.push(7);
    });
    assert_eq!(queue.pop_timeout(Duration::from_secs(2)), Some(7));
    feeder.join().unwrap();
}
