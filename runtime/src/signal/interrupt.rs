//! Thread arming
//!
//! The dispatcher never runs handlers itself. It commits a signal to one
//! target thread through an [`InterruptBackend`]; the target picks the
//! signal up at its next safe point and runs it through the trampoline.

use std::time::Duration;

use crate::task::{ArmedSignal, Thread};

/// Proof that a signal was committed to a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Armed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmError {
    /// Target is inside a runtime critical section; try again shortly
    Retry,
    /// Target already has a signal in flight or blocks this one
    Busy,
    /// Target thread exited
    TargetGone,
}

/// Mechanism used to redirect a thread into a handler
pub trait InterruptBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Commit `signal` to `thread`. On success the thread has been woken
    /// and will run the handler at its next safe point.
    fn arm(&self, thread: &Thread, signal: &ArmedSignal) -> Result<Armed, ArmError>;
}

/// Arms threads by recording the signal in their state and unparking them
#[derive(Debug, Default, Clone, Copy)]
pub struct CooperativeBackend;

impl InterruptBackend for CooperativeBackend {
    fn name(&self) -> &'static str {
        "cooperative"
    }

    fn arm(&self, thread: &Thread, signal: &ArmedSignal) -> Result<Armed, ArmError> {
        let sig = signal.info.sig();
        {
            let mut state = thread.lock_state();
            if !thread.is_alive() {
                return Err(ArmError::TargetGone);
            }
            if state.inside_runtime > 0 {
                state.deferred = true;
                return Err(ArmError::Retry);
            }
            if state.armed.is_some() || state.is_blocked(sig) {
                state.deferred = true;
                return Err(ArmError::Busy);
            }
            state.armed = Some(signal.clone());
        }
        thread.unpark();
        Ok(Armed)
    }
}

/// Bounded retry of `Retry` outcomes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub pause: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, pause: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            pause,
        }
    }

    pub fn run(&self, mut attempt: impl FnMut() -> Result<Armed, ArmError>) -> Result<Armed, ArmError> {
        let mut tries = 1;
        loop {
            match attempt() {
                Err(ArmError::Retry) if tries < self.attempts => {
                    tries += 1;
                    if self.pause.is_zero() {
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(self.pause);
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::constants::*;
    use crate::signal::types::{SigInfo, SignalAction};

    fn armed(sig: u32) -> ArmedSignal {
        ArmedSignal::new(SigInfo::user(sig, 1), SignalAction::handler(|_| {}))
    }

    #[test]
    fn arms_an_idle_thread_once() {
        let thread = Thread::new(7, "t", 0);
        let backend = CooperativeBackend;
        assert_eq!(backend.arm(&thread, &armed(SIGUSR1)), Ok(Armed));
        assert_eq!(backend.arm(&thread, &armed(SIGUSR2)), Err(ArmError::Busy));
        let state = thread.lock_state();
        assert_eq!(state.armed.as_ref().map(|a| a.info.sig()), Some(SIGUSR1));
        assert!(state.deferred);
    }

    #[test]
    fn masked_and_busy_threads_are_refused() {
        let thread = Thread::new(7, "t", sig_mask(SIGUSR1));
        assert_eq!(CooperativeBackend.arm(&thread, &armed(SIGUSR1)), Err(ArmError::Busy));

        thread.lock_state().inside_runtime = 1;
        assert_eq!(CooperativeBackend.arm(&thread, &armed(SIGUSR2)), Err(ArmError::Retry));

        thread.mark_exited();
        assert_eq!(CooperativeBackend.arm(&thread, &armed(SIGUSR2)), Err(ArmError::TargetGone));
    }

    #[test]
    fn retry_policy_is_bounded() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let mut calls = 0;
        let result = policy.run(|| {
            calls += 1;
            Err(ArmError::Retry)
        });
        assert_eq!(result, Err(ArmError::Retry));
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result = policy.run(|| {
            calls += 1;
            if calls == 2 {
                Ok(Armed)
            } else {
                Err(ArmError::Retry)
            }
        });
        assert_eq!(result, Ok(Armed));
    }
}
