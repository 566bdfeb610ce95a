//! Process creation: fork and spawn
//!
//! A child is a new process entry plus a dispatcher thread plus a main
//! thread running a caller-supplied body. There is no address space to
//! copy; what the child inherits is runtime state: the creating thread's
//! mask, the disposition table (reset for spawn), the process group,
//! session and controlling terminal, and a duplicate of the services.

use std::sync::Arc;

use super::process::{Process, ProcessId, ProcessSetup};
use super::services::ProcessServices;
use super::wait::{spawn_watcher, ChildRecord, WaitStatus};
use crate::ipc::pipe::{pipe, pipe_with_capacity, PIPE_BUF};
use crate::signal::constants::SIGKILL;
use crate::signal::dispatcher;
use crate::syscall::errno::Errno;
use crate::task::spawn::{self as thread_spawn, ThreadBody, ThreadRole};
use crate::task::{Context, Thread};

/// How to create a child
#[derive(Default)]
pub struct ForkOptions {
    /// Defaults to the parent's name
    pub name: Option<String>,
    /// Spawn semantics: reset caught signals and run `argv`
    pub exec: Option<Vec<String>>,
    /// Services to use instead of the parent's duplicate
    pub services: Option<Arc<dyn ProcessServices>>,
}

impl ForkOptions {
    pub fn spawn(argv: &[&str]) -> Self {
        ForkOptions {
            name: argv.first().map(|s| s.to_string()),
            exec: Some(argv.iter().map(|s| s.to_string()).collect()),
            services: None,
        }
    }
}

/// Start the dispatcher of `process` and publish its channel
pub(crate) fn launch(process: &Arc<Process>) -> Result<(), Errno> {
    let (reader, writer) = pipe();
    dispatcher::start(process, reader)?;
    process.publish(writer);
    Ok(())
}

/// Create a child of the calling process running `main`
pub fn fork_process(ctx: &Context, options: ForkOptions, main: ThreadBody) -> Result<ProcessId, Errno> {
    let parent = &ctx.process;
    let host = parent.host().ok_or(Errno::EAGAIN)?;
    // Handlers must not observe a half-built child
    let _section = ctx.enter_runtime();

    let (mut dispositions, pgid, sid, ctty) = {
        let inner = parent.lock();
        if inner.children.len() >= parent.config().max_children {
            log::warn!("process {}: child limit {} reached", parent.id, parent.config().max_children);
            return Err(Errno::EAGAIN);
        }
        (inner.dispositions.fork(), inner.pgid, inner.sid, inner.ctty)
    };
    let mask = ctx.thread.mask();

    let services = match (&options.services, &options.exec) {
        (Some(services), _) => services.clone(),
        (None, Some(argv)) => parent.services().exec(argv),
        (None, None) => parent.services().duplicate(),
    };
    if options.exec.is_some() {
        dispositions.exec_reset();
    }

    let pid = ProcessId::new(host.allocate_id()?);
    let name = options.name.unwrap_or_else(|| parent.name.clone());
    let child = Arc::new(Process::new(
        pid,
        &host,
        ProcessSetup {
            name,
            parent: Some(parent.id),
            pgid,
            sid,
            ctty,
            dispositions,
            services,
            held: true,
        },
    ));
    host.insert(child.clone())?;

    let (state_rx, state_tx) = pipe_with_capacity(PIPE_BUF);
    child.set_state_tx(state_tx);
    parent.lock().children.push(ChildRecord::new(child.clone()));

    let rollback = |e: Errno| {
        parent.lock().children.retain(|r| !Arc::ptr_eq(&r.process, &child));
        host.reap(pid);
        e
    };
    spawn_watcher(parent, &child, state_rx).map_err(rollback)?;
    launch(&child).map_err(|e| {
        child.terminate(WaitStatus::signaled(SIGKILL, false));
        e
    })?;

    let thread = Arc::new(Thread::new(pid.as_u32(), &child.name, mask));
    child.add_thread(thread.clone())?;
    if let Err(e) = thread_spawn::start(child.clone(), thread, ThreadRole::Main, main) {
        child.terminate(WaitStatus::signaled(SIGKILL, false));
        return Err(e);
    }

    log::info!("process {} created child {} ({})", parent.id, pid, child.name);
    Ok(pid)
}
