//! Blocking primitives
//!
//! `spin::Mutex` guards short critical sections everywhere else; these are
//! the only places a thread actually sleeps.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Manual-reset event used as a completion object
#[derive(Debug, Default)]
pub struct Event {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock(&self.set) = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.set)
    }

    /// Wait until set or `timeout` elapses. Returns whether the event is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = lock(&self.set);
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            set = self
                .cond
                .wait_timeout(set, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Per-thread wakeup generation counter
///
/// A sleeper reads the current token, re-checks its condition, then parks
/// until the token moves. Any wakeup between the check and the park is
/// therefore never lost.
#[derive(Debug, Default)]
pub struct Parker {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> u64 {
        *lock(&self.generation)
    }

    pub fn unpark(&self) {
        *lock(&self.generation) += 1;
        self.cond.notify_all();
    }

    /// Sleep until the generation differs from `token` or `timeout` passes
    pub fn park(&self, token: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut generation = lock(&self.generation);
        while *generation == token {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            generation = self
                .cond
                .wait_timeout(generation, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn event_wakes_waiter() {
        let event = Arc::new(Event::new());
        let setter = event.clone();
        let handle = thread::spawn(move || setter.set());
        assert!(event.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
        assert!(event.is_set());
    }

    #[test]
    fn event_times_out() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = Parker::new();
        let token = parker.token();
        parker.unpark();
        let start = Instant::now();
        parker.park(token, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
