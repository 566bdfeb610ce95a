//! wait/waitpid/wait3/wait4
//!
//! `options` are the raw `waitpid` bits; exits are always reported, as
//! if `WEXITED` were set.

use super::call;
use super::errno::Errno;
use crate::process::wait::wait_child;
use crate::process::{ProcessId, ResourceUsage, WaitFilter, WaitOptions, WaitResult, WaitStatus};

fn wait_options(raw: u32) -> Result<WaitOptions, Errno> {
    Ok(WaitOptions::from_raw(raw)? | WaitOptions::WEXITED)
}

/// wait4(pid, options) - Wait for a child and collect its resource usage
///
/// `Ok(None)` means `WNOHANG` was given and no matching child has changed
/// state.
pub fn wait4(pid: i32, options: u32) -> Result<Option<WaitResult>, Errno> {
    let options = wait_options(options)?;
    call(|ctx| {
        let result = wait_child(ctx, WaitFilter::from_pid(pid), options)?;
        if let Some(result) = &result {
            log::debug!("process {}: wait4({}) -> {} {}", ctx.process.id, pid, result.pid, result.status);
        }
        Ok(result)
    })
}

/// wait3(options) - `wait4` for any child
pub fn wait3(options: u32) -> Result<Option<WaitResult>, Errno> {
    wait4(-1, options)
}

/// waitpid(pid, options) - Wait for a child to change state
pub fn waitpid(pid: i32, options: u32) -> Result<Option<(ProcessId, WaitStatus)>, Errno> {
    Ok(wait4(pid, options)?.map(|r| (r.pid, r.status)))
}

/// wait() - Block until any child exits
pub fn wait() -> Result<(ProcessId, WaitStatus), Errno> {
    waitpid(-1, 0)?.ok_or(Errno::ECHILD)
}

/// Usage accumulated from reaped children (`getrusage(RUSAGE_CHILDREN)`)
pub fn getrusage_children() -> Result<ResourceUsage, Errno> {
    call(|ctx| Ok(ctx.process.lock().children_usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exits_are_always_reported() {
        let options = wait_options(WaitOptions::WNOHANG.bits()).unwrap();
        assert!(options.contains(WaitOptions::WEXITED | WaitOptions::WNOHANG));
        assert_eq!(wait_options(0x40), Err(Errno::EINVAL));
    }

    #[test]
    fn waiting_outside_a_process_is_esrch() {
        assert_eq!(wait(), Err(Errno::ESRCH));
    }
}
