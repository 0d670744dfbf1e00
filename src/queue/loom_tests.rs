//! Loom model checks for the segment chain
//!
//! Built with `--cfg loom`, the `head`, `tail` and `next` links of
//! [`LinkedRingQueue`] are Loom atomics, so these models drive the queue's
//! own link and head advance code through every interleaving of those links.
//! Segments are two slots wide so the third value forces a link.

use core::num::NonZeroU64;
use std::collections::HashSet;

use loom::sync::Arc;
use loom::thread;

use super::LinkedRingQueue;
use crate::config::QueueConfig;
use crate::metrics::AtomicMetrics;
use crate::ring::scq::ScqSegment;

type Chain = LinkedRingQueue<ScqSegment<2>, AtomicMetrics>;

fn chain(max_threads: usize) -> Arc<Chain> {
    Arc::new(Chain::with_config(QueueConfig::new(max_threads), AtomicMetrics::new()).unwrap())
}

fn token(v: u64) -> NonZeroU64 {
    NonZeroU64::new(v).unwrap()
}

fn drain(queue: &Chain, seen: &mut HashSet<u64>) {
    let me = queue.register();
    while let Some(value) = queue.dequeue(me) {
        assert!(seen.insert(value.get()), "value {} delivered twice", value);
    }
}

#[test]
fn loom_link_race_has_single_winner() {
    loom::model(|| {
        let queue = chain(4);
        let me = queue.register();
        queue.enqueue(token(1), me);
        queue.enqueue(token(2), me);

        let producers: Vec<_> = [3u64, 4]
            .into_iter()
            .map(|v| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let me = queue.register();
                    queue.enqueue(token(v), me);
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        // The losing producer lands its value in the winner's segment.
        let metrics = queue.recorder().snapshot();
        assert_eq!(metrics.segments_linked, 1);
        assert!(metrics.link_races_lost <= 1);
        assert_eq!(queue.segment_count(), 2);

        let mut seen = HashSet::new();
        drain(&queue, &mut seen);
        assert_eq!(seen, HashSet::from([1, 2, 3, 4]));
    });
}

#[test]
fn loom_concurrent_head_advance() {
    loom::model(|| {
        let queue = chain(4);
        let me = queue.register();
        for v in 1..=3 {
            queue.enqueue(token(v), me);
        }
        // Empty the first segment; the head still points at it.
        assert_eq!(queue.dequeue(me), Some(token(1)));
        assert_eq!(queue.dequeue(me), Some(token(2)));

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let me = queue.register();
                    queue.dequeue(me).map(NonZeroU64::get)
                })
            })
            .collect();
        let taken: Vec<u64> = consumers
            .into_iter()
            .filter_map(|c| c.join().unwrap())
            .collect();

        assert_eq!(taken, vec![3]);
        assert_eq!(queue.recorder().snapshot().head_advances, 1);
        assert!(queue.is_empty());
    });
}

#[test]
fn loom_link_while_consuming() {
    loom::model(|| {
        let queue = chain(4);
        let me = queue.register();
        queue.enqueue(token(1), me);
        queue.enqueue(token(2), me);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let me = queue.register();
                queue.enqueue(token(3), me);
            })
        };
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let me = queue.register();
                let mut taken = Vec::new();
                for _ in 0..2 {
                    if let Some(value) = queue.dequeue(me) {
                        taken.push(value.get());
                    }
                }
                taken
            })
        };
        producer.join().unwrap();
        let taken = consumer.join().unwrap();

        let mut seen = HashSet::new();
        for value in taken {
            assert!(seen.insert(value));
        }
        drain(&queue, &mut seen);
        assert_eq!(seen, HashSet::from([1, 2, 3]));
        assert_eq!(queue.recorder().snapshot().segments_linked, 1);
    });
}
