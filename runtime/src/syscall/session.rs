//! Session, process group and terminal calls
//!
//! - setpgid(pid, pgid), getpgid(pid), getpgrp()
//! - setsid(), getsid(pid)
//! - tcsetpgrp(tty, pgid), tcgetpgrp(tty)
//! - set_controlling_terminal(tty) - the `TIOCSCTTY` ioctl
//!
//! Sessions are collections of process groups, optionally bound to a
//! controlling terminal. The terminal's foreground group receives console
//! interrupts.

use std::sync::Arc;

use super::call;
use super::errno::Errno;
use crate::process::{Host, Process, ProcessId, TtyId};
use crate::task::Context;

fn host(ctx: &Context) -> Result<Arc<Host>, Errno> {
    ctx.process.host().ok_or(Errno::ESRCH)
}

/// `pid` 0 is the caller; anyone else must be live
fn lookup(ctx: &Context, pid: i32) -> Result<Arc<Process>, Errno> {
    if pid == 0 {
        return Ok(ctx.process.clone());
    }
    let pid = u32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    host(ctx)?
        .get_process(ProcessId::new(pid))
        .filter(|p| !p.is_exited())
        .ok_or(Errno::ESRCH)
}

/// setpgid(pid, pgid) - Move the caller or one of its children into a group
///
/// `pid` 0 means the caller, `pgid` 0 means a group led by the target.
/// The target must be in the caller's session and must not be a session
/// leader; a group other than the target's own must already exist there.
pub fn setpgid(pid: i32, pgid: i32) -> Result<(), Errno> {
    call(|ctx| {
        if pgid < 0 {
            return Err(Errno::EINVAL);
        }
        let target = lookup(ctx, pid)?;
        if !Arc::ptr_eq(&target, &ctx.process) {
            let is_child = ctx
                .process
                .lock()
                .children
                .iter()
                .any(|c| c.pid() == target.id && c.exited.is_none());
            if !is_child {
                return Err(Errno::ESRCH);
            }
        }

        let pgid = if pgid == 0 { target.id } else { ProcessId::new(pgid as u32) };
        let sid = ctx.process.sid();
        if target.sid() != sid || target.sid() == target.id {
            return Err(Errno::EPERM);
        }
        if pgid != target.id && !host(ctx)?.session_has_group(sid, pgid) {
            return Err(Errno::EPERM);
        }
        target.lock().pgid = pgid;
        log::debug!("process {}: joined group {}", target.id, pgid);
        Ok(())
    })
}

/// getpgid(pid) - Process group of `pid` (0 for the caller)
pub fn getpgid(pid: i32) -> Result<ProcessId, Errno> {
    call(|ctx| Ok(lookup(ctx, pid)?.pgid()))
}

/// getpgrp() - Process group of the caller
pub fn getpgrp() -> Result<ProcessId, Errno> {
    getpgid(0)
}

/// setsid() - Create a new session led by the caller
///
/// The caller becomes leader of a new session and a new group, with no
/// controlling terminal. Fails with `EPERM` if the caller already leads a
/// process group.
pub fn setsid() -> Result<ProcessId, Errno> {
    call(|ctx| {
        let id = ctx.process.id;
        if !host(ctx)?.process_group(id).is_empty() {
            return Err(Errno::EPERM);
        }
        {
            let mut inner = ctx.process.lock();
            inner.sid = id;
            inner.pgid = id;
            inner.ctty = None;
        }
        log::info!("process {}: new session", id);
        Ok(id)
    })
}

/// getsid(pid) - Session of `pid` (0 for the caller)
pub fn getsid(pid: i32) -> Result<ProcessId, Errno> {
    call(|ctx| Ok(lookup(ctx, pid)?.sid()))
}

/// tcsetpgrp(tty, pgid) - Make `pgid` the foreground group of `tty`
///
/// `tty` must be the caller's controlling terminal and `pgid` a group in
/// the caller's session.
pub fn tcsetpgrp(tty: TtyId, pgid: ProcessId) -> Result<(), Errno> {
    call(|ctx| {
        if ctx.process.ctty() != Some(tty) {
            return Err(Errno::ENOTTY);
        }
        let host = host(ctx)?;
        if !host.session_has_group(ctx.process.sid(), pgid) {
            return Err(Errno::EPERM);
        }
        host.update_terminal(tty, |t| t.foreground = Some(pgid)).ok_or(Errno::ENOTTY)?;
        log::debug!("tty {}: foreground group {}", tty, pgid);
        Ok(())
    })
}

/// tcgetpgrp(tty) - Foreground group of the caller's controlling terminal
pub fn tcgetpgrp(tty: TtyId) -> Result<Option<ProcessId>, Errno> {
    call(|ctx| {
        if ctx.process.ctty() != Some(tty) {
            return Err(Errno::ENOTTY);
        }
        Ok(host(ctx)?.terminal(tty).ok_or(Errno::ENOTTY)?.foreground)
    })
}

/// Acquire `tty` as the controlling terminal of the caller's session
///
/// Only a session leader without a terminal may do this, and only for a
/// terminal no other session owns. The caller's group becomes the
/// foreground group.
pub fn set_controlling_terminal(tty: TtyId) -> Result<(), Errno> {
    call(|ctx| {
        let (sid, pgid, ctty) = {
            let inner = ctx.process.lock();
            (inner.sid, inner.pgid, inner.ctty)
        };
        if sid != ctx.process.id || ctty.is_some_and(|t| t != tty) {
            return Err(Errno::EPERM);
        }
        let claimed = host(ctx)?
            .update_terminal(tty, |t| match t.session {
                Some(owner) if owner != sid => false,
                _ => {
                    t.session = Some(sid);
                    t.foreground = Some(pgid);
                    true
                }
            })
            .ok_or(Errno::ENOTTY)?;
        if !claimed {
            return Err(Errno::EPERM);
        }
        ctx.process.lock().ctty = Some(tty);
        log::info!("process {}: controlling terminal {}", sid, tty);
        Ok(())
    })
}
