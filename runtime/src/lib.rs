//! POSIX process and signal runtime
//!
//! Emulates UNIX signal delivery, job control and child reaping for a host
//! that only offers threads, events and pipes. A [`process::Host`] owns any
//! number of emulated processes; each one runs its own signal dispatcher
//! thread and talks to its peers exclusively through pipe channels.
//!
//! Layout:
//! - `signal`: signal numbers, dispositions, the wire packet, the channel,
//!   the dispatcher thread and the arming/trampoline machinery
//! - `task`: POSIX threads and the per-thread signal state
//! - `interrupts`: hardware exception translation
//! - `process`: the process table, fork/spawn and the wait engine
//! - `ipc`: pipes, the capability handle table and commune queries
//! - `syscall`: the POSIX-facing call surface

pub mod config;
pub mod interrupts;
pub mod ipc;
pub mod log_buffer;
pub mod logger;
pub mod process;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod task;

pub use config::RuntimeConfig;
pub use process::{AttachGuard, Host, ProcessId};
pub use syscall::errno::Errno;
