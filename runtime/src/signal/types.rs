//! Signal-related data structures

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use super::constants::*;

/// Signal information carried with every delivery (a flat `siginfo_t`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigInfo {
    /// Signal number; negative values are dispatcher control operations
    pub signo: i32,
    /// Origin code (SI_USER, SEGV_MAPERR, CLD_EXITED, ...)
    pub code: i32,
    pub errno: i32,
    /// Originating process
    pub pid: u32,
    pub uid: u32,
    /// `sigqueue` payload or SIGCHLD status
    pub value: u64,
    /// Faulting address for hardware signals
    pub addr: u64,
}

impl SigInfo {
    /// Signal sent by `kill` from `pid`
    pub fn user(sig: u32, pid: u32) -> Self {
        SigInfo {
            signo: sig as i32,
            code: SI_USER,
            pid,
            ..Default::default()
        }
    }

    /// Signal generated by the runtime itself
    pub fn kernel(sig: u32, code: i32) -> Self {
        SigInfo {
            signo: sig as i32,
            code,
            ..Default::default()
        }
    }

    pub fn sig(&self) -> u32 {
        if self.signo > 0 {
            self.signo as u32
        } else {
            0
        }
    }
}

bitflags! {
    /// `sa_flags` values, Linux x86_64 numbering
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SaFlags: u64 {
        /// Do not generate SIGCHLD when children stop or continue
        const NOCLDSTOP = 0x0000_0001;
        /// Do not turn terminated children into zombies
        const NOCLDWAIT = 0x0000_0002;
        /// Handler takes the full `SigInfo`
        const SIGINFO = 0x0000_0004;
        /// Restart interrupted blocking calls
        const RESTART = 0x1000_0000;
        /// Don't block the signal while its handler runs
        const NODEFER = 0x4000_0000;
        /// Reset to SIG_DFL on delivery
        const RESETHAND = 0x8000_0000;
    }
}

/// Signal handler callback
pub type HandlerFn = Arc<dyn Fn(&SigInfo) + Send + Sync>;

/// Disposition of a single signal
#[derive(Clone, Default)]
pub enum SigHandler {
    #[default]
    Default,
    Ignore,
    Catch(HandlerFn),
}

impl fmt::Debug for SigHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigHandler::Default => f.write_str("SIG_DFL"),
            SigHandler::Ignore => f.write_str("SIG_IGN"),
            SigHandler::Catch(h) => write!(f, "handler@{:p}", Arc::as_ptr(h)),
        }
    }
}

/// Default action for a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDefaultAction {
    /// Terminate the process
    Terminate,
    /// Ignore the signal
    Ignore,
    /// Terminate with core dump
    CoreDump,
    /// Stop (pause) the process
    Stop,
    /// Continue a stopped process
    Continue,
}

/// Get the default action for a signal
pub fn default_action(sig: u32) -> SignalDefaultAction {
    match sig {
        // Terminate
        SIGHUP | SIGINT | SIGKILL | SIGPIPE | SIGALRM | SIGTERM | SIGUSR1 | SIGUSR2 | SIGIO
        | SIGPWR | SIGSTKFLT | SIGVTALRM | SIGPROF => SignalDefaultAction::Terminate,

        // Core dump
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV | SIGXCPU | SIGXFSZ
        | SIGSYS => SignalDefaultAction::CoreDump,

        // Ignore
        SIGCHLD | SIGURG | SIGWINCH => SignalDefaultAction::Ignore,

        // Stop
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => SignalDefaultAction::Stop,

        // Continue
        SIGCONT => SignalDefaultAction::Continue,

        // Realtime signals
        _ => SignalDefaultAction::Terminate,
    }
}

/// Signal handler configuration (a `struct sigaction`)
#[derive(Debug, Clone, Default)]
pub struct SignalAction {
    pub handler: SigHandler,
    /// Signals to block during handler execution
    pub mask: u64,
    pub flags: SaFlags,
}

impl SignalAction {
    /// Install `f` as a handler with an empty mask and no flags
    pub fn handler(f: impl Fn(&SigInfo) + Send + Sync + 'static) -> Self {
        SignalAction {
            handler: SigHandler::Catch(Arc::new(f)),
            mask: 0,
            flags: SaFlags::empty(),
        }
    }

    pub fn ignore() -> Self {
        SignalAction {
            handler: SigHandler::Ignore,
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: SaFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_mask(mut self, mask: u64) -> Self {
        self.mask = mask;
        self
    }

    /// Check if handler is the default action
    #[inline]
    pub fn is_default(&self) -> bool {
        matches!(self.handler, SigHandler::Default)
    }

    /// Check if handler ignores the signal
    #[inline]
    pub fn is_ignore(&self) -> bool {
        matches!(self.handler, SigHandler::Ignore)
    }

    /// Check if handler is a user function
    #[inline]
    pub fn is_user_handler(&self) -> bool {
        matches!(self.handler, SigHandler::Catch(_))
    }

    /// True when delivering `sig` under this action is a no-op
    pub fn ignores(&self, sig: u32) -> bool {
        self.is_ignore()
            || (self.is_default() && default_action(sig) == SignalDefaultAction::Ignore)
    }
}

/// Process-wide disposition table shared by every thread
#[derive(Debug, Clone)]
pub struct Dispositions {
    /// One entry per signal, index `sig - 1`
    actions: Vec<SignalAction>,
}

impl Default for Dispositions {
    fn default() -> Self {
        Dispositions {
            actions: vec![SignalAction::default(); NSIG as usize],
        }
    }
}

impl Dispositions {
    /// Get handler for a signal
    ///
    /// Returns the default action for invalid signal numbers
    pub fn get(&self, sig: u32) -> SignalAction {
        if is_valid_signal(sig) {
            self.actions[(sig - 1) as usize].clone()
        } else {
            SignalAction::default()
        }
    }

    pub fn flags(&self, sig: u32) -> SaFlags {
        if is_valid_signal(sig) {
            self.actions[(sig - 1) as usize].flags
        } else {
            SaFlags::empty()
        }
    }

    /// Set handler for a signal, returning the previous one
    ///
    /// Does nothing for invalid signal numbers
    pub fn set(&mut self, sig: u32, action: SignalAction) -> SignalAction {
        if is_valid_signal(sig) {
            core::mem::replace(&mut self.actions[(sig - 1) as usize], action)
        } else {
            SignalAction::default()
        }
    }

    /// Copy for a forked child: every disposition is inherited
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Reset caught signals to SIG_DFL; ignored signals stay ignored
    pub fn exec_reset(&mut self) {
        for action in self.actions.iter_mut() {
            if action.is_user_handler() {
                *action = SignalAction::default();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_actions_follow_posix() {
        assert_eq!(default_action(SIGTERM), SignalDefaultAction::Terminate);
        assert_eq!(default_action(SIGSEGV), SignalDefaultAction::CoreDump);
        assert_eq!(default_action(SIGCHLD), SignalDefaultAction::Ignore);
        assert_eq!(default_action(SIGTSTP), SignalDefaultAction::Stop);
        assert_eq!(default_action(SIGCONT), SignalDefaultAction::Continue);
        assert_eq!(default_action(SIGRTMIN + 3), SignalDefaultAction::Terminate);
    }

    #[test]
    fn ignores_covers_default_ignore_signals() {
        assert!(SignalAction::default().ignores(SIGWINCH));
        assert!(!SignalAction::default().ignores(SIGTERM));
        assert!(SignalAction::ignore().ignores(SIGTERM));
        assert!(!SignalAction::handler(|_| {}).ignores(SIGCHLD));
    }

    #[test]
    fn exec_reset_keeps_ignored_drops_handlers() {
        let mut table = Dispositions::default();
        table.set(SIGUSR1, SignalAction::handler(|_| {}));
        table.set(SIGHUP, SignalAction::ignore());

        let child = table.fork();
        assert!(child.get(SIGUSR1).is_user_handler());

        table.exec_reset();
        assert!(table.get(SIGUSR1).is_default());
        assert!(table.get(SIGHUP).is_ignore());
    }

    #[test]
    fn invalid_signal_numbers_are_inert() {
        let mut table = Dispositions::default();
        table.set(0, SignalAction::ignore());
        table.set(NSIG + 1, SignalAction::ignore());
        assert!(table.get(0).is_default());
        assert!(table.get(NSIG + 1).is_default());
    }
}
