//! OS thread shim for POSIX threads
//!
//! Every POSIX thread runs its body inside [`run`], which installs the
//! thread context, converts unwinds into process exits and tells the
//! dispatcher when the thread is gone.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::thread::{Thread, ThreadId};
use super::{require_current, set_current, Context, ProcessExit};
use crate::process::wait::WaitStatus;
use crate::process::Process;
use crate::signal::channel::{self, Outgoing};
use crate::signal::constants::{signal_name, SIGABRT};
use crate::signal::delivery;
use crate::signal::packet::{ControlOp, SignalPacket};
use crate::signal::pending::PendingEntry;
use crate::syscall::errno::Errno;

pub(crate) type ThreadBody = Box<dyn FnOnce() -> i32 + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadRole {
    /// Returning from the body exits the process with its value
    Main,
    Secondary,
}

/// Handle to a running POSIX thread
pub struct ThreadHandle {
    tid: ThreadId,
    join: JoinHandle<()>,
}

impl ThreadHandle {
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// Wait for the OS thread to finish
    pub fn join(self) -> Result<(), Errno> {
        self.join.join().map_err(|_| Errno::ESRCH)
    }
}

/// Start a new thread in the caller's process (`pthread_create`)
pub fn spawn_thread<F>(f: F) -> Result<ThreadHandle, Errno>
where
    F: FnOnce() + Send + 'static,
{
    let ctx = require_current()?;
    let host = ctx.process.host().ok_or(Errno::ESRCH)?;
    let tid = host.allocate_id()?;
    let thread = Arc::new(Thread::new(tid, &format!("thread-{}", tid), ctx.thread.mask()));
    ctx.process.add_thread(thread.clone())?;
    let body: ThreadBody = Box::new(move || {
        f();
        0
    });
    start(ctx.process.clone(), thread.clone(), ThreadRole::Secondary, body).inspect_err(|_| {
        ctx.process.remove_thread(thread.tid);
    })
}

pub(crate) fn start(
    process: Arc<Process>,
    thread: Arc<Thread>,
    role: ThreadRole,
    body: ThreadBody,
) -> Result<ThreadHandle, Errno> {
    let tid = thread.tid;
    let name = match role {
        ThreadRole::Main => format!("pid-{}", process.id),
        ThreadRole::Secondary => format!("tid-{}", tid),
    };
    std::thread::Builder::new()
        .name(name)
        .spawn(move || run(process, thread, role, body))
        .map(|join| ThreadHandle { tid, join })
        .map_err(|e| {
            log::error!("failed to start thread {}: {}", tid, e);
            Errno::EAGAIN
        })
}

fn run(process: Arc<Process>, thread: Arc<Thread>, role: ThreadRole, body: ThreadBody) {
    set_current(Some(Context::new(process.clone(), thread.clone())));
    if role == ThreadRole::Main {
        // Children start held so nothing is delivered before this point
        if let Err(e) = channel::control(&process, ControlOp::NoHold, false) {
            log::debug!("process {}: release not sent: {}", process.id, e);
        }
    }
    log::debug!("process {} thread {} started", process.id, thread.tid);

    let result = catch_unwind(AssertUnwindSafe(|| {
        delivery::safe_point();
        body()
    }));
    match result {
        Ok(code) if role == ThreadRole::Main => process.terminate(WaitStatus::exited(code)),
        Ok(_) => {}
        Err(payload) if payload.is::<ProcessExit>() => {}
        Err(payload) => {
            log::error!(
                "process {} thread {} panicked: {}",
                process.id,
                thread.tid,
                panic_message(payload.as_ref())
            );
            process.terminate(WaitStatus::signaled(SIGABRT, process.config().core_dumps));
        }
    }

    finish(&process, &thread);
    set_current(None);
}

/// Retire `thread` and let the dispatcher release signals aimed at it
pub(crate) fn finish(process: &Arc<Process>, thread: &Thread) {
    let unrun = thread.mark_exited();
    process.remove_thread(thread.tid);
    if !process.is_exited() {
        // A process-wide signal armed here goes back to the queue for the
        // remaining threads; one aimed at this thread dies with it.
        if let Some(armed) = unrun.filter(|a| a.target == 0) {
            log::debug!(
                "process {} thread {}: requeueing unrun {}",
                process.id,
                thread.tid,
                signal_name(armed.info.sig())
            );
            process.lock().pending.insert(PendingEntry { info: armed.info, target: 0 });
        }
        let mut packet = SignalPacket::control(ControlOp::ThreadExit, process.id.as_u32());
        packet.target_tid = thread.tid;
        if let Err(e) = channel::send(Some(process), process, Outgoing::new(packet)) {
            log::debug!("process {} thread {}: exit notice not sent: {}", process.id, thread.tid, e);
        }
    }
    log::debug!("process {} thread {} finished", process.id, thread.tid);
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}
