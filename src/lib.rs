//! posixrt
//!
//! POSIX signals, job control and child reaping for hosts that only offer
//! threads, events and pipes. The work is done by the `runtime` crate; this
//! crate re-exports it and adds a prelude for embedders.
//!
//! ```no_run
//! use std::sync::Arc;
//! use posixrt::prelude::*;
//!
//! let host = Host::new(RuntimeConfig::from_env());
//! let _shell = host.attach("sh", Arc::new(StaticServices::new(&["sh"])))?;
//! let child = fork(|| 3)?;
//! let (pid, status) = waitpid(child.as_u32() as i32, 0)?.ok_or(Errno::ECHILD)?;
//! assert_eq!((pid, status.exit_code()), (child, Some(3)));
//! # Ok::<(), Errno>(())
//! ```

pub use runtime::{config, interrupts, ipc, log_buffer, logger, process, signal, sync, syscall, task};
pub use runtime::{AttachGuard, Errno, Host, ProcessId, RuntimeConfig};

/// Everything an embedder usually needs
pub mod prelude {
    pub use runtime::interrupts::{
        raise_exception, Backing, DebuggerAction, ExceptionCode, FaultOutcome, FaultRecord, FlatMemoryMap,
    };
    pub use runtime::process::{ForkOptions, ProcessServices, StaticServices, WaitOptions, WaitStatus};
    pub use runtime::signal::constants::*;
    pub use runtime::signal::{safe_point, SaFlags, SigInfo, SignalAction};
    pub use runtime::syscall::*;
    pub use runtime::{AttachGuard, Errno, Host, ProcessId, RuntimeConfig};
}
