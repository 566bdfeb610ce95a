//! POSIX threads and their signal state
//!
//! Every OS thread that runs POSIX code is registered with its process as a
//! `Thread`. The dispatcher consults the thread list to pick a delivery
//! target and arms it; the thread itself runs the armed handler at its next
//! safe point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use spin::{Mutex, MutexGuard};

use crate::process::wait::WaitQueueEntry;
use crate::signal::constants::*;
use crate::signal::types::{SaFlags, SigInfo, SignalAction};
use crate::sync::Parker;

/// Thread identifier; the main thread's id equals its process id
pub type ThreadId = u32;

/// A signal committed to a thread, waiting for its next safe point
#[derive(Debug, Clone)]
pub struct ArmedSignal {
    pub info: SigInfo,
    /// Disposition resolved at arming time
    pub action: SignalAction,
    /// Signals added to the mask while the handler runs
    pub delta: u64,
    /// Thread the sender named, 0 for a process-wide signal
    pub target: ThreadId,
}

impl ArmedSignal {
    pub fn new(info: SigInfo, action: SignalAction) -> Self {
        let sig = info.sig();
        let mut delta = action.mask;
        if !action.flags.contains(SaFlags::NODEFER) {
            delta |= sig_mask(sig);
        }
        ArmedSignal {
            info,
            action,
            delta: delta & !UNCATCHABLE_SIGNALS,
            target: 0,
        }
    }

    pub fn directed(mut self, target: ThreadId) -> Self {
        self.target = target;
        self
    }
}

/// Per-thread signal state, guarded by the thread's own lock
#[derive(Debug, Default)]
pub struct ThreadSignalState {
    /// Blocked signals; SIGKILL and SIGSTOP are never set
    pub mask: u64,
    /// At most one signal in flight per thread
    pub armed: Option<ArmedSignal>,
    /// Mask to restore after a `sigsuspend` handler returns
    pub saved_mask: Option<u64>,
    /// Depth of runtime-internal critical sections; no arming while non-zero
    pub inside_runtime: u32,
    /// Signals accepted by a pending `sigwait`
    pub wait_set: u64,
    /// Signal handed to `sigwait` by the dispatcher
    pub waited: Option<SigInfo>,
    /// A signal fell back to pending because this thread could not take it
    pub deferred: bool,
}

impl ThreadSignalState {
    /// Mask with the unmaskable bits stripped
    pub fn set_mask(&mut self, mask: u64) {
        self.mask = mask & !UNCATCHABLE_SIGNALS;
    }

    #[inline]
    pub fn is_blocked(&self, sig: u32) -> bool {
        self.mask & sig_mask(sig) != 0
    }
}

pub struct Thread {
    pub tid: ThreadId,
    pub name: String,
    state: Mutex<ThreadSignalState>,
    parker: Parker,
    alive: AtomicBool,
    wait_entry: Mutex<Option<Arc<WaitQueueEntry>>>,
}

impl Thread {
    pub fn new(tid: ThreadId, name: &str, mask: u64) -> Self {
        let mut state = ThreadSignalState::default();
        state.set_mask(mask);
        Thread {
            tid,
            name: name.to_string(),
            state: Mutex::new(state),
            parker: Parker::new(),
            alive: AtomicBool::new(true),
            wait_entry: Mutex::new(None),
        }
    }

    pub fn lock_state(&self) -> MutexGuard<'_, ThreadSignalState> {
        self.state.lock()
    }

    pub fn mask(&self) -> u64 {
        self.state.lock().mask
    }

    pub fn has_armed(&self) -> bool {
        self.state.lock().armed.is_some()
    }

    /// Flags of the armed signal, if any
    pub fn armed_flags(&self) -> Option<SaFlags> {
        self.state.lock().armed.as_ref().map(|a| a.action.flags)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Retire the thread. Returns the signal it was armed with but never ran.
    pub(crate) fn mark_exited(&self) -> Option<ArmedSignal> {
        self.alive.store(false, Ordering::Release);
        let armed = self.state.lock().armed.take();
        self.parker.unpark();
        armed
    }

    pub fn token(&self) -> u64 {
        self.parker.token()
    }

    pub fn park(&self, token: u64, timeout: Duration) {
        self.parker.park(token, timeout);
    }

    pub fn unpark(&self) {
        self.parker.unpark();
    }

    /// This thread's reusable wait queue entry
    pub(crate) fn wait_entry(self: &Arc<Self>) -> Arc<WaitQueueEntry> {
        let mut slot = self.wait_entry.lock();
        slot.get_or_insert_with(|| Arc::new(WaitQueueEntry::new(self.tid, Arc::downgrade(self))))
            .clone()
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Weak handle used by wait queue entries to wake their owner
pub type ThreadRef = Weak<Thread>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmaskable_bits_are_stripped() {
        let thread = Thread::new(1, "t", u64::MAX);
        assert_eq!(thread.mask() & UNCATCHABLE_SIGNALS, 0);
        assert!(thread.lock_state().is_blocked(SIGUSR1));
        assert!(!thread.lock_state().is_blocked(SIGKILL));
    }

    #[test]
    fn armed_delta_honours_nodefer() {
        let action = SignalAction::handler(|_| {}).with_mask(sig_mask(SIGUSR2));
        let armed = ArmedSignal::new(SigInfo::user(SIGUSR1, 1), action.clone());
        assert_eq!(armed.delta, sig_mask(SIGUSR1) | sig_mask(SIGUSR2));

        let armed = ArmedSignal::new(
            SigInfo::user(SIGUSR1, 1),
            action.with_flags(SaFlags::NODEFER),
        );
        assert_eq!(armed.delta, sig_mask(SIGUSR2));
    }

    #[test]
    fn exited_thread_hands_back_its_armed_signal() {
        let thread = Thread::new(3, "t", 0);
        thread.lock_state().armed = Some(ArmedSignal::new(
            SigInfo::user(SIGHUP, 1),
            SignalAction::handler(|_| {}),
        ));
        let unrun = thread.mark_exited();
        assert!(!thread.is_alive());
        assert!(!thread.has_armed());
        assert_eq!(unrun.map(|a| (a.info.sig(), a.target)), Some((SIGHUP, 0)));
        assert!(thread.mark_exited().is_none());
    }
}
