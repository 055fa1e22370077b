//! Broadcast event with a live-member count
//!
//! A generation counter, not a semaphore: [`BroadcastEvent::wait`] records
//! the generation when it starts and returns once a later generation has
//! been signaled. A notification that finished before the call started is
//! never consumed by it, and one notification releases every waiter that was
//! queued when it happened.
//!
//! Besides blocked waiters, resources can hold explicit registrations (for
//! example one per in-flight transfer). Teardown cancels the outstanding
//! operations and then calls [`BroadcastEvent::wait_idle`], which returns
//! once every registration has been dropped.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    generation: u64,
    waiting: usize,
    registered: usize,
}

/// Wait/notify-all primitive with a member counter
#[derive(Debug, Default)]
pub struct BroadcastEvent {
    state: Mutex<State>,
    cond: Condvar,
}

impl BroadcastEvent {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the next `notify_all` after this call began
    pub fn wait(&self) {
        let mut state = self.lock();
        let seen = state.generation;
        state.waiting += 1;
        while state.generation == seen {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting -= 1;
    }

    /// Like [`wait`](Self::wait) with an upper bound; returns false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        let seen = state.generation;
        state.waiting += 1;
        while state.generation == seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.waiting -= 1;
        state.generation != seen
    }

    /// Advance the generation and wake every current waiter
    pub fn notify_all(&self) {
        let mut state = self.lock();
        state.generation = state.generation.wrapping_add(1);
        drop(state);
        self.cond.notify_all();
    }

    /// Add a live member
    pub fn register(&self) {
        self.lock().registered += 1;
    }

    /// Drop a live member and notify all waiters
    pub fn unregister(&self) {
        let mut state = self.lock();
        state.registered = state.registered.saturating_sub(1);
        state.generation = state.generation.wrapping_add(1);
        drop(state);
        self.cond.notify_all();
    }

    /// Blocked waiters plus live registrations
    pub fn members(&self) -> usize {
        let state = self.lock();
        state.waiting + state.registered
    }

    /// Live registrations only
    pub fn registered(&self) -> usize {
        self.lock().registered
    }

    /// Block until no registrations remain
    ///
    /// The check and the wait happen under the event's lock, so an
    /// `unregister` racing with this call is never missed.
    pub fn wait_idle(&self) {
        let mut state = self.lock();
        state.waiting += 1;
        while state.registered > 0 {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting -= 1;
    }

    /// Bounded [`wait_idle`](Self::wait_idle); returns false on timeout
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        state.waiting += 1;
        while state.registered > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.waiting -= 1;
        state.registered == 0
    }

    /// Number of notifications so far
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_without_waiters_is_not_remembered() {
        let event = BroadcastEvent::new();
        event.notify_all();
        assert_eq!(event.generation(), 1);

        // the earlier notification must not release a later waiter
        assert!(!event.wait_timeout(Duration::from_millis(20)));
        assert_eq!(event.members(), 0);
    }

    #[test]
    fn test_register_counts_members() {
        let event = BroadcastEvent::new();
        event.register();
        event.register();
        assert_eq!(event.members(), 2);
        assert_eq!(event.registered(), 2);

        event.unregister();
        event.unregister();
        event.unregister();
        assert_eq!(event.members(), 0);
    }

    #[test]
    fn test_wait_idle_returns_after_last_unregister() {
        let event = Arc::new(BroadcastEvent::new());
        event.register();

        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_idle())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        event.unregister();
        waiter.join().unwrap();
        assert_eq!(event.members(), 0);
    }

    #[test]
    fn test_wait_idle_timeout() {
        let event = BroadcastEvent::new();
        assert!(event.wait_idle_timeout(Duration::from_millis(1)));

        event.register();
        assert!(!event.wait_idle_timeout(Duration::from_millis(10)));
        assert_eq!(event.members(), 1);
    }
}
