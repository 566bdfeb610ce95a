//! Signal-related calls
//!
//! - kill(pid, sig), killpg(pgid, sig), raise(sig) - send a signal
//! - sigqueue(pid, sig, value) - send with a payload
//! - pthread_kill(tid, sig) - send to one thread of the caller's process
//! - sigaction(sig, act) - install or query a disposition
//! - sigprocmask(how, set) - block/unblock signals
//! - sigpending(), sigsuspend(mask), pause()
//! - sigwait(set), sigwaitinfo(set), sigtimedwait(set, timeout)

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::call;
use super::errno::Errno;
use crate::ipc::handle::MaskSlot;
use crate::process::{Process, ProcessId};
use crate::signal::channel::{self, Outgoing};
use crate::signal::constants::*;
use crate::signal::delivery;
use crate::signal::packet::{ControlOp, SignalPacket};
use crate::signal::types::{SigInfo, SignalAction};
use crate::task::{self, Context, ThreadId};

/// Longest park between checks in blocking signal calls
const SIGNAL_POLL: Duration = Duration::from_millis(100);

fn check_signal(sig: u32) -> Result<(), Errno> {
    if sig == 0 || is_valid_signal(sig) {
        Ok(())
    } else {
        log::warn!("invalid signal number {}", sig);
        Err(Errno::EINVAL)
    }
}

/// Ask the dispatcher to look at the pending queue again and wait for it
fn flush_pending(ctx: &Context) {
    if let Err(e) = channel::flush(&ctx.process, true) {
        log::debug!("process {}: flush failed: {}", ctx.process.id, e);
    }
}

fn send(ctx: &Context, target: &Arc<Process>, info: SigInfo, tid: ThreadId) -> Result<(), Errno> {
    let host = ctx.process.host().ok_or(Errno::ESRCH)?;
    host.send_signal(Some(&ctx.process), target, info, tid)
}

/// kill(pid, sig) - Send a signal to a process or group
///
/// * `pid > 0`: that process
/// * `pid == 0`: every process in the caller's group
/// * `pid == -1`: every process except the caller
/// * `pid < -1`: every process in group `-pid`
///
/// Signal 0 only checks that the target exists.
pub fn kill(pid: i32, sig: u32) -> Result<(), Errno> {
    call(|ctx| {
        check_signal(sig)?;
        let host = ctx.process.host().ok_or(Errno::ESRCH)?;
        let info = SigInfo::user(sig, ctx.process.id.as_u32());
        match pid {
            0 => host.signal_group(Some(&ctx.process), ctx.process.pgid(), info),
            -1 => {
                let mut delivered = false;
                for target in host.all_processes() {
                    if target.id != ctx.process.id && !target.is_exited() {
                        delivered |= send(ctx, &target, info, 0).is_ok();
                    }
                }
                if delivered {
                    Ok(())
                } else {
                    Err(Errno::ESRCH)
                }
            }
            pid if pid < 0 => host.signal_group(Some(&ctx.process), ProcessId::new(pid.unsigned_abs()), info),
            pid => {
                let target = host.get_process(ProcessId::new(pid as u32)).ok_or(Errno::ESRCH)?;
                log::debug!(
                    "kill: {} ({}) from {} to {}",
                    sig,
                    signal_name(sig),
                    ctx.process.id,
                    target.id
                );
                send(ctx, &target, info, 0)
            }
        }
    })
}

/// killpg(pgid, sig) - Send a signal to every member of a group
pub fn killpg(pgid: i32, sig: u32) -> Result<(), Errno> {
    if pgid < 0 {
        return Err(Errno::EINVAL);
    }
    kill(-pgid, sig)
}

/// raise(sig) - Send a signal to the calling thread
///
/// A caught signal's handler has run by the time this returns.
pub fn raise(sig: u32) -> Result<(), Errno> {
    let tid = task::require_current()?.thread.tid;
    pthread_kill(tid, sig)
}

/// sigqueue(pid, sig, value) - Send a signal carrying a value
pub fn sigqueue(pid: i32, sig: u32, value: u64) -> Result<(), Errno> {
    call(|ctx| {
        check_signal(sig)?;
        let host = ctx.process.host().ok_or(Errno::ESRCH)?;
        let target = u32::try_from(pid)
            .ok()
            .and_then(|pid| host.get_process(ProcessId::new(pid)))
            .ok_or(Errno::ESRCH)?;
        let info = SigInfo {
            code: SI_QUEUE,
            value,
            ..SigInfo::user(sig, ctx.process.id.as_u32())
        };
        send(ctx, &target, info, 0)
    })
}

/// pthread_kill(tid, sig) - Send a signal to one thread of this process
pub fn pthread_kill(tid: ThreadId, sig: u32) -> Result<(), Errno> {
    call(|ctx| {
        check_signal(sig)?;
        let thread = ctx.process.find_thread(tid).ok_or(Errno::ESRCH)?;
        if !thread.is_alive() {
            return Err(Errno::ESRCH);
        }
        let info = SigInfo {
            code: SI_TKILL,
            ..SigInfo::user(sig, ctx.process.id.as_u32())
        };
        send(ctx, &ctx.process, info, tid)
    })
}

/// sigaction(sig, act) - Install `act` (if any) and return the old action
///
/// SIGKILL and SIGSTOP can be queried but not changed. Installing an
/// action that ignores `sig` discards a pending instance.
pub fn sigaction(sig: u32, act: Option<SignalAction>) -> Result<SignalAction, Errno> {
    call(|ctx| {
        if !is_valid_signal(sig) {
            return Err(Errno::EINVAL);
        }
        let _section = ctx.enter_runtime();
        let mut inner = ctx.process.lock();
        let Some(mut act) = act else {
            return Ok(inner.dispositions.get(sig));
        };
        if !is_catchable(sig) {
            log::warn!("sigaction: cannot change {} ({})", sig, signal_name(sig));
            return Err(Errno::EINVAL);
        }
        act.mask &= !UNCATCHABLE_SIGNALS;
        if act.ignores(sig) {
            inner.pending.remove(sig);
        }
        log::debug!("process {}: {} -> {:?}", ctx.process.id, signal_name(sig), act.handler);
        Ok(inner.dispositions.set(sig, act))
    })
}

/// sigprocmask(how, set) - Change the calling thread's mask
///
/// Returns the previous mask. With `set == None` only queries.
pub fn sigprocmask(how: i32, set: Option<u64>) -> Result<u64, Errno> {
    call(|ctx| {
        let (old, new, deferred) = {
            let mut state = ctx.thread.lock_state();
            let old = state.mask;
            if let Some(set) = set {
                let mask = match how {
                    SIG_BLOCK => old | set,
                    SIG_UNBLOCK => old & !set,
                    SIG_SETMASK => set,
                    _ => return Err(Errno::EINVAL),
                };
                state.set_mask(mask);
            }
            (old, state.mask, core::mem::take(&mut state.deferred))
        };
        let unblocked = old & !new;
        if deferred || ctx.process.pending_bits() & unblocked != 0 {
            flush_pending(ctx);
        }
        Ok(old)
    })
}

/// sigpending() - Signals pending for the calling process
pub fn sigpending() -> Result<u64, Errno> {
    call(|ctx| {
        let slot = Arc::new(MaskSlot::new());
        let packet = SignalPacket::control(ControlOp::Pending, ctx.process.id.as_u32());
        channel::send(
            Some(&ctx.process),
            &ctx.process,
            Outgoing::new(packet).with_mask(slot.clone()).wait(),
        )?;
        Ok(slot.load())
    })
}

/// sigsuspend(mask) - Replace the mask and wait for a handler to run
///
/// Always fails: `EINTR` once a handler has run, `ESRCH` if the caller is
/// not a POSIX thread.
pub fn sigsuspend(mask: u64) -> Errno {
    let ctx = match task::require_current() {
        Ok(ctx) => ctx,
        Err(e) => return e,
    };
    delivery::deliver(&ctx);
    suspend(&ctx, mask);
    Errno::EINTR
}

/// pause() - Wait until a handler has run
pub fn pause() -> Errno {
    match task::require_current() {
        Ok(ctx) => sigsuspend(ctx.thread.mask()),
        Err(e) => e,
    }
}

fn suspend(ctx: &Context, mask: u64) {
    let (unblocked, deferred) = {
        let mut state = ctx.thread.lock_state();
        state.saved_mask = Some(state.mask);
        state.set_mask(mask);
        (!state.mask, core::mem::take(&mut state.deferred))
    };
    if deferred || ctx.process.pending_bits() & unblocked != 0 {
        flush_pending(ctx);
    }

    loop {
        let token = ctx.thread.token();
        if ctx.thread.has_armed() || ctx.process.is_exited() {
            break;
        }
        ctx.thread.park(token, SIGNAL_POLL);
    }
    delivery::deliver(ctx);

    let mut state = ctx.thread.lock_state();
    if let Some(saved) = state.saved_mask.take() {
        state.set_mask(saved);
    }
}

/// sigwait(set) - Accept one signal from `set` without running its handler
pub fn sigwait(set: u64) -> Result<u32, Errno> {
    sigwaitinfo(set).map(|info| info.sig())
}

/// sigwaitinfo(set) - Like `sigwait`, returning the full signal information
pub fn sigwaitinfo(set: u64) -> Result<SigInfo, Errno> {
    call(|ctx| accept(ctx, set, None))
}

/// sigtimedwait(set, timeout) - Like `sigwaitinfo`, failing with `EAGAIN`
/// once `timeout` passes
pub fn sigtimedwait(set: u64, timeout: Duration) -> Result<SigInfo, Errno> {
    call(|ctx| accept(ctx, set, Some(Instant::now() + timeout)))
}

fn accept(ctx: &Context, set: u64, deadline: Option<Instant>) -> Result<SigInfo, Errno> {
    let set = set & !UNCATCHABLE_SIGNALS;
    if set == 0 {
        return Err(Errno::EINVAL);
    }

    {
        let mut inner = ctx.process.lock();
        if let Some(entry) = inner.pending.take_for(set, ctx.thread.tid) {
            return Ok(entry.info);
        }
        let mut state = ctx.thread.lock_state();
        state.waited = None;
        state.wait_set = set;
    }

    loop {
        let token = ctx.thread.token();
        {
            let mut state = ctx.thread.lock_state();
            if let Some(info) = state.waited.take() {
                return Ok(info);
            }
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if state.armed.is_some() || expired || ctx.process.is_exited() {
                state.wait_set = 0;
                return Err(if state.armed.is_some() || !expired {
                    Errno::EINTR
                } else {
                    Errno::EAGAIN
                });
            }
        }
        let slice = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(SIGNAL_POLL),
            None => SIGNAL_POLL,
        };
        ctx.thread.park(token, slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_numbers_are_validated() {
        assert_eq!(check_signal(0), Ok(()));
        assert_eq!(check_signal(SIGUSR1), Ok(()));
        assert_eq!(check_signal(NSIG + 1), Err(Errno::EINVAL));
    }

    #[test]
    fn calls_outside_a_process_fail_with_esrch() {
        assert_eq!(kill(1, SIGTERM), Err(Errno::ESRCH));
        assert_eq!(sigprocmask(SIG_BLOCK, Some(0)), Err(Errno::ESRCH));
        assert_eq!(sigsuspend(0), Errno::ESRCH);
        assert_eq!(pause(), Errno::ESRCH);
    }
}
