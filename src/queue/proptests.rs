//! Property-based tests for the segmented queues using proptest
//!
//! Sequential histories are checked against a `VecDeque` model; concurrent
//! runs are checked for exactly-once delivery.

use super::*;
use crate::remap::CacheRemap;
use crate::ring::crq::PaddedCell;
use crate::ring::prq::PrqSegment;
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone)]
enum Op {
    Enqueue(u32),
    Dequeue,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u32>().prop_map(Op::Enqueue),
        2 => Just(Op::Dequeue),
    ]
}

fn check_against_model<S: Segment>(ops: &[Op]) -> TestCaseResult {
    let queue: Queue<u32, S> = Queue::new(1);
    let me = queue.register();
    let mut model = VecDeque::new();

    for op in ops {
        match op {
            Op::Enqueue(value) => {
                queue.enqueue(*value, me);
                model.push_back(*value);
            }
            Op::Dequeue => {
                prop_assert_eq!(queue.dequeue(me), model.pop_front());
            }
        }
    }
    while let Some(expected) = model.pop_front() {
        prop_assert_eq!(queue.dequeue(me), Some(expected));
    }
    prop_assert_eq!(queue.dequeue(me), None);
    Ok(())
}

/// Property: a single thread sees a plain FIFO queue
mod sequential_properties {
    use super::*;

    proptest! {
        #[test]
        fn test_lscq_matches_fifo_model(ops in prop::collection::vec(op_strategy(), 0..400)) {
            check_against_model::<ScqSegment<4>>(&ops)?;
            check_against_model::<ScqSegment<32, false>>(&ops)?;
        }

        #[test]
        fn test_lcrq_matches_fifo_model(ops in prop::collection::vec(op_strategy(), 0..400)) {
            check_against_model::<CrqSegment<4>>(&ops)?;
            check_against_model::<CrqSegment<8, PaddedCell, false>>(&ops)?;
        }

        #[test]
        fn test_lprq_matches_fifo_model(ops in prop::collection::vec(op_strategy(), 0..400)) {
            check_against_model::<PrqSegment<4>>(&ops)?;
            check_against_model::<PrqSegment<2, false>>(&ops)?;
        }

        #[test]
        fn test_segment_count_tracks_capacity(count in 0usize..200) {
            let queue: LscQueue<usize, 8> = LscQueue::new(1);
            let me = queue.register();
            for i in 0..count {
                queue.enqueue(i, me);
            }
            let expected = if count == 0 { 1 } else { count.div_ceil(8) };
            prop_assert_eq!(queue.segment_count(), expected);
        }
    }
}

/// Property: the cache remap is a bijection for every layout
mod remap_properties {
    use super::*;

    proptest! {
        #[test]
        fn test_remap_is_bijection(
            shift in 0u32..16,
            cell_size in prop::sample::select(vec![1usize, 8, 16, 32, 64, 128, 256]),
            enabled in any::<bool>(),
        ) {
            let size = 1usize << shift;
            let remap = CacheRemap::new(size, cell_size, enabled);
            let mut seen = vec![false; size];
            for i in 0..size as u64 {
                let p = remap.map(i);
                prop_assert!(p < size);
                prop_assert!(!seen[p]);
                seen[p] = true;
            }
        }

        #[test]
        fn test_remap_depends_only_on_slot(
            shift in 1u32..12,
            ticket in any::<u64>(),
        ) {
            let size = 1usize << shift;
            let remap = CacheRemap::new(size, 16, true);
            let slot = ticket % size as u64;
            prop_assert_eq!(remap.map(ticket), remap.map(slot));
        }
    }
}

/// Property: concurrent producers never lose or duplicate a value
mod concurrent_properties {
    use super::*;

    fn deliver_exactly_once<S: Segment + 'static>(
        producers: usize,
        items: usize,
    ) -> TestCaseResult {
        let queue: Arc<Queue<usize, S>> = Arc::new(Queue::new(producers + 2));

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let me = queue.register();
                    for i in 0..items {
                        queue.enqueue(p * items + i, me);
                    }
                })
            })
            .collect();

        let consumer = {
            let queue = Arc::clone(&queue);
            let total = producers * items;
            thread::spawn(move || {
                let me = queue.register();
                let mut seen = Vec::with_capacity(total);
                while seen.len() < total {
                    match queue.dequeue(me) {
                        Some(value) => seen.push(value),
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        let seen = consumer.join().unwrap();

        let unique: HashSet<usize> = seen.iter().copied().collect();
        prop_assert_eq!(unique.len(), seen.len());
        prop_assert_eq!(unique, (0..producers * items).collect::<HashSet<_>>());
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_lscq_delivers_exactly_once(producers in 1usize..5, items in 1usize..500) {
            deliver_exactly_once::<ScqSegment<16>>(producers, items)?;
        }

        #[test]
        fn test_lcrq_delivers_exactly_once(producers in 1usize..5, items in 1usize..500) {
            deliver_exactly_once::<CrqSegment<16>>(producers, items)?;
        }

        #[test]
        fn test_lprq_delivers_exactly_once(producers in 1usize..5, items in 1usize..500) {
            deliver_exactly_once::<PrqSegment<16>>(producers, items)?;
        }
    }
}
