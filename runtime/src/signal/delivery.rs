//! Signal delivery at safe points
//!
//! A thread takes delivery of its armed signal whenever it passes through
//! the runtime: on entry to and exit from every call, and whenever a
//! blocking call wakes up. The same point enforces job control (a stopped
//! process parks here) and process exit (threads unwind from here).

use std::time::Duration;

use super::trampoline;
use crate::task::{self, unwind_exit, Context};

/// Poll interval while parked in the stop gate
const STOP_POLL: Duration = Duration::from_millis(50);

/// Deliver anything armed for the calling thread
pub fn safe_point() {
    if let Some(ctx) = task::current() {
        deliver(&ctx);
    }
}

/// Run armed handlers for `ctx` until nothing is armed
///
/// Does nothing while the thread is inside a runtime section. Unwinds the
/// thread if its process has exited.
pub fn deliver(ctx: &Context) {
    loop {
        if ctx.process.is_exited() {
            unwind_exit();
        }
        stop_gate(ctx);

        let armed = {
            let mut state = ctx.thread.lock_state();
            if state.inside_runtime > 0 {
                None
            } else {
                state.armed.take()
            }
        };
        match armed {
            Some(armed) => trampoline::invoke(ctx, armed),
            None => return,
        }
    }
}

/// Park while the process is stopped; unwind if it has exited
pub(crate) fn stop_gate(ctx: &Context) {
    loop {
        let token = ctx.thread.token();
        if ctx.process.is_exited() {
            unwind_exit();
        }
        if !ctx.process.is_stopped() {
            return;
        }
        ctx.thread.park(token, STOP_POLL);
    }
}
