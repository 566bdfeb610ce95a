//! Process-wide pending signal queue
//!
//! Standard signals are counted, not queued: each signal number holds at
//! most one undelivered instance. Raising a signal that is already pending
//! is a no-op.

use super::constants::*;
use super::types::SigInfo;
use crate::task::ThreadId;

/// One undelivered signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub info: SigInfo,
    /// Thread the signal was directed at, 0 for the whole process
    pub target: ThreadId,
}

#[derive(Debug, Clone)]
pub struct PendingSignals {
    entries: [Option<PendingEntry>; NSIG as usize],
    bits: u64,
}

impl Default for PendingSignals {
    fn default() -> Self {
        PendingSignals {
            entries: [None; NSIG as usize],
            bits: 0,
        }
    }
}

impl PendingSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entry. Returns false if the signal was already pending.
    pub fn insert(&mut self, entry: PendingEntry) -> bool {
        let sig = entry.info.sig();
        if !is_valid_signal(sig) || self.bits & sig_mask(sig) != 0 {
            return false;
        }
        self.entries[(sig - 1) as usize] = Some(entry);
        self.bits |= sig_mask(sig);
        true
    }

    pub fn remove(&mut self, sig: u32) -> Option<PendingEntry> {
        if !is_valid_signal(sig) {
            return None;
        }
        self.bits &= !sig_mask(sig);
        self.entries[(sig - 1) as usize].take()
    }

    /// Remove the lowest signal in `set` that `tid` may accept
    pub fn take_for(&mut self, set: u64, tid: ThreadId) -> Option<PendingEntry> {
        let sig = signals_in(self.bits & set).find(|&sig| {
            matches!(self.entries[(sig - 1) as usize], Some(e) if e.target == 0 || e.target == tid)
        })?;
        self.remove(sig)
    }

    #[inline]
    pub fn contains(&self, sig: u32) -> bool {
        self.bits & sig_mask(sig) != 0
    }

    /// Bitmap of pending signal numbers
    #[inline]
    pub fn bits(&self) -> u64 {
        self.bits
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Drop every pending signal in `mask`
    pub fn discard(&mut self, mask: u64) {
        for sig in signals_in(self.bits & mask) {
            self.remove(sig);
        }
    }

    /// Remove and return all entries, lowest signal number first
    pub fn drain(&mut self) -> Vec<PendingEntry> {
        let sigs: Vec<u32> = signals_in(self.bits).collect();
        sigs.into_iter().filter_map(|sig| self.remove(sig)).collect()
    }

    /// Entries directed at a thread that no longer exists go to the process
    pub fn retarget(&mut self, dead: ThreadId) {
        for entry in self.entries.iter_mut().flatten() {
            if entry.target == dead {
                entry.target = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sig: u32) -> PendingEntry {
        PendingEntry {
            info: SigInfo::user(sig, 7),
            target: 0,
        }
    }

    #[test]
    fn second_insert_is_a_noop() {
        let mut pending = PendingSignals::new();
        assert!(pending.insert(entry(SIGUSR1)));
        assert!(!pending.insert(entry(SIGUSR1)));
        assert_eq!(pending.bits(), sig_mask(SIGUSR1));
        assert!(pending.remove(SIGUSR1).is_some());
        assert!(pending.remove(SIGUSR1).is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn drain_is_ordered_by_signal_number() {
        let mut pending = PendingSignals::new();
        pending.insert(entry(SIGTERM));
        pending.insert(entry(SIGHUP));
        pending.insert(entry(SIGCHLD));
        let order: Vec<u32> = pending.drain().iter().map(|e| e.info.sig()).collect();
        assert_eq!(order, vec![SIGHUP, SIGTERM, SIGCHLD]);
        assert!(pending.is_empty());
    }

    #[test]
    fn discard_removes_only_masked_signals() {
        let mut pending = PendingSignals::new();
        pending.insert(entry(SIGTSTP));
        pending.insert(entry(SIGTTIN));
        pending.insert(entry(SIGUSR2));
        pending.discard(STOP_SIGNALS);
        assert_eq!(pending.bits(), sig_mask(SIGUSR2));
    }

    #[test]
    fn retarget_releases_dead_thread_entries() {
        let mut pending = PendingSignals::new();
        pending.insert(PendingEntry {
            info: SigInfo::user(SIGUSR1, 1),
            target: 42,
        });
        pending.retarget(42);
        assert_eq!(pending.remove(SIGUSR1).map(|e| e.target), Some(0));
    }

    #[test]
    fn take_for_skips_entries_directed_elsewhere() {
        let mut pending = PendingSignals::new();
        pending.insert(PendingEntry {
            info: SigInfo::user(SIGUSR1, 1),
            target: 9,
        });
        pending.insert(entry(SIGUSR2));
        let set = sig_mask(SIGUSR1) | sig_mask(SIGUSR2);
        assert_eq!(pending.take_for(set, 4).map(|e| e.info.sig()), Some(SIGUSR2));
        assert!(pending.take_for(set, 4).is_none());
        assert_eq!(pending.take_for(set, 9).map(|e| e.info.sig()), Some(SIGUSR1));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let mut pending = PendingSignals::new();
        assert!(!pending.insert(entry(0)));
        assert!(!pending.insert(entry(NSIG + 1)));
    }
}
