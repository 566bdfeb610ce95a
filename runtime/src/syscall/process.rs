//! Process lifecycle and introspection calls
//!
//! - fork(main), fork_with(options, main), spawn(argv, main)
//! - exit(code)
//! - getpid(), getppid(), gettid()
//! - proc_cwd(pid) .. proc_fd_name(pid, fd) - commune queries

use std::convert::Infallible;

use super::call;
use super::errno::Errno;
use crate::ipc::commune::{self, CommuneQuery};
use crate::process::fork::fork_process;
use crate::process::{ForkOptions, ProcessId, WaitStatus};
use crate::task::{self, unwind_exit, ThreadId};

/// fork(main) - Create a child process running `main`
///
/// The child inherits the calling thread's mask and the process's
/// dispositions, but not its pending signals. Its main thread returns the
/// exit code.
pub fn fork<F>(main: F) -> Result<ProcessId, Errno>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    fork_with(ForkOptions::default(), main)
}

/// fork with explicit name and services
pub fn fork_with<F>(options: ForkOptions, main: F) -> Result<ProcessId, Errno>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    call(|ctx| fork_process(ctx, options, Box::new(main)))
}

/// spawn(argv, main) - fork followed by exec of `argv`
///
/// Caught signals revert to their default action in the child; ignored
/// signals stay ignored.
pub fn spawn<F>(argv: &[&str], main: F) -> Result<ProcessId, Errno>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    fork_with(ForkOptions::spawn(argv), main)
}

/// exit(code) - Terminate the calling process
///
/// Never returns on a POSIX thread: every thread of the process unwinds.
pub fn exit(code: i32) -> Result<Infallible, Errno> {
    let ctx = task::require_current()?;
    log::debug!("process {}: exit({})", ctx.process.id, code);
    ctx.process.terminate(WaitStatus::exited(code));
    unwind_exit()
}

pub fn getpid() -> Result<ProcessId, Errno> {
    Ok(task::require_current()?.process.id)
}

/// Parent pid; 1 once the parent has exited, 0 for a root process
pub fn getppid() -> Result<ProcessId, Errno> {
    Ok(task::require_current()?.process.ppid())
}

pub fn gettid() -> Result<ThreadId, Errno> {
    Ok(task::require_current()?.thread.tid)
}

fn query(pid: ProcessId, query: CommuneQuery) -> Result<Vec<String>, Errno> {
    call(|ctx| commune::request(ctx, pid, query))
}

fn single(mut records: Vec<String>) -> Result<String, Errno> {
    records.pop().ok_or(Errno::EPIPE)
}

/// Working directory of `pid`
pub fn proc_cwd(pid: ProcessId) -> Result<String, Errno> {
    single(query(pid, CommuneQuery::Cwd)?)
}

/// Root directory of `pid`
pub fn proc_root(pid: ProcessId) -> Result<String, Errno> {
    single(query(pid, CommuneQuery::Root)?)
}

/// Argument vector of `pid`
pub fn proc_cmdline(pid: ProcessId) -> Result<Vec<String>, Errno> {
    query(pid, CommuneQuery::Cmdline)
}

pub fn proc_environ(pid: ProcessId) -> Result<Vec<String>, Errno> {
    query(pid, CommuneQuery::Environ)
}

/// Open descriptors of `pid`
pub fn proc_fds(pid: ProcessId) -> Result<Vec<i32>, Errno> {
    query(pid, CommuneQuery::Fds)?
        .iter()
        .map(|fd| fd.parse().map_err(|_| Errno::EINVAL))
        .collect()
}

/// Canonical name of descriptor `fd` in `pid`
pub fn proc_fd_name(pid: ProcessId, fd: i32) -> Result<String, Errno> {
    single(query(pid, CommuneQuery::FdName(fd))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_calls_need_a_process() {
        assert_eq!(getpid(), Err(Errno::ESRCH));
        assert_eq!(gettid(), Err(Errno::ESRCH));
        assert_eq!(exit(0).err(), Some(Errno::ESRCH));
    }

    #[test]
    fn single_record_answers() {
        assert_eq!(single(vec![String::from("/tmp")]), Ok(String::from("/tmp")));
        assert_eq!(single(Vec::new()), Err(Errno::EPIPE));
    }
}
