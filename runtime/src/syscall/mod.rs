//! POSIX call surface
//!
//! Every call runs on a registered POSIX thread, returns `Result<T, Errno>`
//! and passes through a safe point on entry and on exit, so a signal sent
//! to the calling thread is handled before the call returns.

pub mod errno;
pub mod process;
pub mod session;
pub mod signal;
pub mod wait;

pub use errno::Errno;
pub use process::{
    exit, fork, fork_with, getpid, getppid, gettid, proc_cmdline, proc_cwd, proc_environ, proc_fd_name,
    proc_fds, proc_root, spawn,
};
pub use session::{
    getpgid, getpgrp, getsid, set_controlling_terminal, setpgid, setsid, tcgetpgrp, tcsetpgrp,
};
pub use signal::{
    kill, killpg, pause, pthread_kill, raise, sigaction, sigpending, sigprocmask, sigqueue, sigsuspend,
    sigtimedwait, sigwait, sigwaitinfo,
};
pub use wait::{getrusage_children, wait, wait3, wait4, waitpid};

pub use crate::task::spawn_thread as pthread_create;

use crate::signal::delivery;
use crate::task::{self, Context};

/// Run `f` for the calling thread between two safe points
pub(crate) fn call<T>(f: impl FnOnce(&Context) -> Result<T, Errno>) -> Result<T, Errno> {
    let ctx = task::require_current()?;
    delivery::deliver(&ctx);
    let result = f(&ctx);
    delivery::deliver(&ctx);
    result
}
