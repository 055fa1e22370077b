//! Integration tests for the shared synchronization primitives
//!
//! Tests GuardedSet and BroadcastEvent under real thread interleavings:
//! - GuardedSet operations behave like a sequential set
//! - One notification releases every queued waiter
//! - Member counts track waiters and registrations

use common::{BroadcastEvent, GuardedSet};
use proptest::prelude::*;
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// ============================================================================
// GuardedSet
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    Insert(u8),
    Erase(u8),
    Contains(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..16).prop_map(Op::Insert),
        (0u8..16).prop_map(Op::Erase),
        (0u8..16).prop_map(Op::Contains),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every thread owns a disjoint key range, so each thread's own history
    /// must match a sequential set exactly even while other threads mutate
    /// the same set concurrently.
    #[test]
    fn prop_guarded_set_is_linearizable(
        histories in prop::collection::vec(prop::collection::vec(op_strategy(), 1..64), 2..6)
    ) {
        let set = Arc::new(GuardedSet::<(usize, u8)>::new());
        let barrier = Arc::new(Barrier::new(histories.len()));

        let handles: Vec<_> = histories
            .iter()
            .cloned()
            .enumerate()
            .map(|(thread_id, ops)| {
                let set = Arc::clone(&set);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut model = HashSet::new();
                    for op in ops {
                        match op {
                            Op::Insert(k) => {
                                assert_eq!(set.insert((thread_id, k)), model.insert(k));
                            }
                            Op::Erase(k) => {
                                assert_eq!(set.erase(&(thread_id, k)), model.remove(&k));
                            }
                            Op::Contains(k) => {
                                assert_eq!(set.contains(&(thread_id, k)), model.contains(&k));
                            }
                        }
                    }
                    model.len()
                })
            })
            .collect();

        let mut expected = 0;
        for handle in handles {
            expected += handle.join().expect("worker panicked");
        }
        prop_assert_eq!(set.len(), expected);
    }
}

#[test]
fn test_concurrent_insert_of_same_key_wins_once() {
    let set = Arc::new(GuardedSet::new());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let set = Arc::clone(&set);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                set.insert((1u8, 4u8))
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&won| won)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(set.len(), 1);
}

// ============================================================================
// BroadcastEvent
// ============================================================================

fn wait_for_members(event: &BroadcastEvent, count: usize) {
    for _ in 0..1000 {
        if event.members() == count {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("expected {} members, have {}", count, event.members());
}

#[test]
fn test_one_notify_releases_all_waiters() {
    const WAITERS: usize = 6;
    let event = Arc::new(BroadcastEvent::new());

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                let jitter = rand::rng().random_range(0..5);
                thread::sleep(Duration::from_millis(jitter));
                event.wait();
            })
        })
        .collect();

    wait_for_members(&event, WAITERS);
    event.notify_all();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(event.members(), 0);
}

#[test]
fn test_late_waiter_needs_new_notification() {
    let event = Arc::new(BroadcastEvent::new());
    event.notify_all();
    event.notify_all();

    let waiter = {
        let event = Arc::clone(&event);
        thread::spawn(move || event.wait())
    };

    wait_for_members(&event, 1);
    thread::sleep(Duration::from_millis(20));
    assert!(!waiter.is_finished());

    event.notify_all();
    waiter.join().unwrap();
    assert_eq!(event.generation(), 3);
}

#[test]
fn test_members_counts_waiters_and_registrations() {
    let event = Arc::new(BroadcastEvent::new());
    event.register();

    let waiter = {
        let event = Arc::clone(&event);
        thread::spawn(move || event.wait())
    };
    wait_for_members(&event, 2);

    // unregister notifies, which releases the waiter too
    event.unregister();
    waiter.join().unwrap();
    assert_eq!(event.members(), 0);
}

#[test]
fn test_wait_idle_with_concurrent_unregisters() {
    const MEMBERS: usize = 32;
    let event = Arc::new(BroadcastEvent::new());
    for _ in 0..MEMBERS {
        event.register();
    }

    let handles: Vec<_> = (0..MEMBERS)
        .map(|_| {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                let delay = rand::rng().random_range(0..10);
                thread::sleep(Duration::from_millis(delay));
                event.unregister();
            })
        })
        .collect();

    assert!(event.wait_idle_timeout(Duration::from_secs(5)));
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(event.registered(), 0);
}
