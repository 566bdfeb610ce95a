//! POSIX thread context
//!
//! Each OS thread running POSIX code carries a [`Context`] naming its
//! process and its [`Thread`] record. Runtime calls made from a thread with
//! no context fail with `ESRCH`.

use std::cell::RefCell;
use std::sync::Arc;

use crate::process::Process;
use crate::signal::channel;
use crate::syscall::errno::Errno;

pub mod spawn;
pub mod thread;

pub use spawn::{spawn_thread, ThreadHandle};
pub use thread::{ArmedSignal, Thread, ThreadId, ThreadSignalState};

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Unwind payload used to leave a thread whose process has exited
#[derive(Debug)]
pub struct ProcessExit;

/// The process and thread the calling OS thread belongs to
#[derive(Clone)]
pub struct Context {
    pub process: Arc<Process>,
    pub thread: Arc<Thread>,
}

impl Context {
    pub fn new(process: Arc<Process>, thread: Arc<Thread>) -> Self {
        Context { process, thread }
    }

    /// Enter a runtime-internal section; the dispatcher will not arm this
    /// thread until the guard is dropped.
    pub fn enter_runtime(&self) -> RuntimeGuard<'_> {
        self.thread.lock_state().inside_runtime += 1;
        RuntimeGuard { ctx: self }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Context(pid {}, tid {})", self.process.id, self.thread.tid)
    }
}

pub struct RuntimeGuard<'a> {
    ctx: &'a Context,
}

impl Drop for RuntimeGuard<'_> {
    fn drop(&mut self) {
        let deferred = {
            let mut state = self.ctx.thread.lock_state();
            state.inside_runtime = state.inside_runtime.saturating_sub(1);
            if state.inside_runtime == 0 {
                core::mem::take(&mut state.deferred)
            } else {
                false
            }
        };
        // A delivery bounced off this section; ask the dispatcher to retry.
        if deferred {
            if let Err(e) = channel::flush(&self.ctx.process, false) {
                log::debug!("process {}: deferred flush not sent: {}", self.ctx.process.id, e);
            }
        }
    }
}

/// Context of the calling thread
pub fn current() -> Option<Context> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Context of the calling thread, or `ESRCH` for foreign threads
pub fn require_current() -> Result<Context, Errno> {
    current().ok_or(Errno::ESRCH)
}

pub(crate) fn set_current(ctx: Option<Context>) -> Option<Context> {
    CURRENT.with(|c| core::mem::replace(&mut *c.borrow_mut(), ctx))
}

/// Leave the current thread because its process is gone
pub fn unwind_exit() -> ! {
    std::panic::resume_unwind(Box::new(ProcessExit))
}
