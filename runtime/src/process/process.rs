//! Process structure and lifecycle

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use spin::{Mutex, MutexGuard};

use super::manager::{Host, TtyId};
use super::services::ProcessServices;
use super::wait::{ChildEvent, ChildRecord, ResourceUsage, WaitQueueEntry, WaitStatus};
use crate::config::RuntimeConfig;
use crate::ipc::handle::{Capability, HandleTable};
use crate::ipc::pipe::PipeWriter;
use crate::signal::interrupt::InterruptBackend;
use crate::signal::packet::{ControlOp, SignalPacket};
use crate::signal::pending::PendingSignals;
use crate::signal::types::Dispositions;
use crate::sync::Event;
use crate::syscall::errno::Errno;
use crate::task::{Thread, ThreadId};

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const fn new(id: u32) -> Self {
        ProcessId(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Channel not yet published
    Initializing,
    Running,
    /// Stopped by a job-control signal
    Stopped,
    Exited,
}

/// Where a sender stands with a process's channel
pub(crate) enum ChannelState {
    Initializing,
    Published(PipeWriter),
    Gone,
}

/// Mutable process state, guarded by the process lock
pub struct ProcessInner {
    pub parent: Option<ProcessId>,
    pub pgid: ProcessId,
    pub sid: ProcessId,
    pub ctty: Option<TtyId>,
    pub state: ProcessState,
    pub exit_status: Option<WaitStatus>,
    /// Signal that stopped the process, 0 when not stopped
    pub stop_signal: u32,
    pub dispositions: Dispositions,
    pub pending: PendingSignals,
    /// Delivery held; every signal goes pending
    pub held: bool,
    pub threads: Vec<Arc<Thread>>,
    pub children: Vec<ChildRecord>,
    /// Threads blocked in `wait`
    pub wait_list: Vec<Arc<WaitQueueEntry>>,
    /// Usage of reaped children
    pub children_usage: ResourceUsage,
    /// Parent exited; reported parent is 1
    pub orphaned: bool,
    pub(crate) channel: Option<PipeWriter>,
    /// State-change pipe read by the parent's watcher
    pub(crate) state_tx: Option<PipeWriter>,
}

/// Parameters a new process starts with
pub(crate) struct ProcessSetup {
    pub name: String,
    pub parent: Option<ProcessId>,
    pub pgid: ProcessId,
    pub sid: ProcessId,
    pub ctty: Option<TtyId>,
    pub dispositions: Dispositions,
    pub services: Arc<dyn ProcessServices>,
    pub held: bool,
}

/// An emulated process
pub struct Process {
    /// Unique process identifier
    pub id: ProcessId,

    /// Process name (for debugging)
    pub name: String,

    host: Weak<Host>,
    config: Arc<RuntimeConfig>,
    backend: Arc<dyn InterruptBackend>,
    inner: Mutex<ProcessInner>,

    /// Capabilities granted by peers, consumed by the dispatcher
    handles: Mutex<HandleTable>,

    services: Arc<dyn ProcessServices>,
    started: Instant,
    dispatcher_done: AtomicBool,
}

impl Process {
    pub(crate) fn new(id: ProcessId, host: &Arc<Host>, setup: ProcessSetup) -> Self {
        Process {
            id,
            name: setup.name,
            host: Arc::downgrade(host),
            config: host.shared_config(),
            backend: host.backend(),
            inner: Mutex::new(ProcessInner {
                parent: setup.parent,
                pgid: setup.pgid,
                sid: setup.sid,
                ctty: setup.ctty,
                state: ProcessState::Initializing,
                exit_status: None,
                stop_signal: 0,
                dispositions: setup.dispositions,
                pending: PendingSignals::new(),
                held: setup.held,
                threads: Vec::new(),
                children: Vec::new(),
                wait_list: Vec::new(),
                children_usage: ResourceUsage::default(),
                orphaned: false,
                channel: None,
                state_tx: None,
            }),
            handles: Mutex::new(HandleTable::new()),
            services: setup.services,
            started: Instant::now(),
            dispatcher_done: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ProcessInner> {
        self.inner.lock()
    }

    pub fn host(&self) -> Option<Arc<Host>> {
        self.host.upgrade()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &dyn InterruptBackend {
        self.backend.as_ref()
    }

    pub(crate) fn handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock()
    }

    pub fn services(&self) -> Arc<dyn ProcessServices> {
        self.services.clone()
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    pub fn is_exited(&self) -> bool {
        self.state() == ProcessState::Exited
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ProcessState::Stopped
    }

    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.inner.lock().exit_status
    }

    pub fn pgid(&self) -> ProcessId {
        self.inner.lock().pgid
    }

    pub fn sid(&self) -> ProcessId {
        self.inner.lock().sid
    }

    pub fn ctty(&self) -> Option<TtyId> {
        self.inner.lock().ctty
    }

    /// Parent as reported by `getppid`: 1 once orphaned, 0 for a root
    pub fn ppid(&self) -> ProcessId {
        let inner = self.inner.lock();
        match inner.parent {
            Some(parent) => parent,
            None if inner.orphaned => ProcessId::new(1),
            None => ProcessId::new(0),
        }
    }

    pub fn pending_bits(&self) -> u64 {
        self.inner.lock().pending.bits()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner.lock().threads.clone()
    }

    pub fn find_thread(&self, tid: ThreadId) -> Option<Arc<Thread>> {
        self.inner.lock().threads.iter().find(|t| t.tid == tid).cloned()
    }

    pub(crate) fn add_thread(&self, thread: Arc<Thread>) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        if inner.state == ProcessState::Exited {
            return Err(Errno::ESRCH);
        }
        inner.threads.push(thread);
        Ok(())
    }

    pub(crate) fn remove_thread(&self, tid: ThreadId) {
        self.inner.lock().threads.retain(|t| t.tid != tid);
    }

    pub(crate) fn wake_threads(&self) {
        for thread in self.threads() {
            thread.unpark();
        }
    }

    /// Time since the process was created
    pub fn lifetime(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn channel_state(&self) -> ChannelState {
        let inner = self.inner.lock();
        match (&inner.channel, inner.state) {
            (_, ProcessState::Exited) => ChannelState::Gone,
            (Some(writer), _) => ChannelState::Published(writer.clone()),
            (None, ProcessState::Initializing) => ChannelState::Initializing,
            (None, _) => ChannelState::Gone,
        }
    }

    /// Make the channel reachable and mark the process running
    pub(crate) fn publish(&self, writer: PipeWriter) {
        let mut inner = self.inner.lock();
        if inner.state == ProcessState::Initializing {
            inner.channel = Some(writer);
            inner.state = ProcessState::Running;
        }
    }

    pub(crate) fn set_state_tx(&self, tx: PipeWriter) {
        self.inner.lock().state_tx = Some(tx);
    }

    pub fn dispatcher_done(&self) -> bool {
        self.dispatcher_done.load(Ordering::Acquire)
    }

    pub(crate) fn set_dispatcher_done(&self) {
        self.dispatcher_done.store(true, Ordering::Release);
        self.handles.lock().clear();
    }

    /// Report a stop or continue to the parent's watcher
    pub(crate) fn notify_parent(&self, event: ChildEvent) {
        let tx = self.inner.lock().state_tx.clone();
        if let Some(tx) = tx {
            if let Err(e) = tx.write_all(&event.encode()) {
                log::debug!("process {}: parent not listening: {}", self.id, e);
            }
        }
    }

    pub(crate) fn orphan(&self) {
        let mut inner = self.inner.lock();
        inner.parent = None;
        inner.orphaned = true;
    }

    /// Terminate from any thread but the dispatcher
    ///
    /// The first caller decides the exit status; later calls do nothing. The
    /// dispatcher is told to stop and drained before this returns.
    pub fn terminate(self: &Arc<Self>, status: WaitStatus) {
        let Some(exited) = self.do_exit(status) else {
            return;
        };
        let Some(channel) = exited.channel else {
            return;
        };
        let event = Arc::new(Event::new());
        let mut packet = SignalPacket::control(ControlOp::Exit, self.id.as_u32());
        packet.completion_ref = Some(self.handles().insert(Capability::Completion(event.clone())));
        if channel.write_all(&packet.encode()).is_err() {
            return;
        }
        drop(channel);

        let deadline = Instant::now() + self.config.send_timeout;
        while !event.wait_timeout(Duration::from_millis(20)) && !self.dispatcher_done() {
            if Instant::now() >= deadline {
                log::warn!("process {}: dispatcher did not drain before exit", self.id);
                return;
            }
        }
    }

    /// Terminate from the dispatcher thread; the dispatcher stops itself
    pub(crate) fn exit_from_dispatcher(self: &Arc<Self>, status: WaitStatus) {
        drop(self.do_exit(status));
    }

    /// Common exit path, run once by whichever caller gets there first
    fn do_exit(self: &Arc<Self>, status: WaitStatus) -> Option<Exited> {
        let (channel, state_tx, children, waiters, threads) = {
            let mut inner = self.inner.lock();
            if inner.state == ProcessState::Exited {
                return None;
            }
            inner.state = ProcessState::Exited;
            inner.exit_status = Some(status);
            (
                inner.channel.take(),
                inner.state_tx.take(),
                core::mem::take(&mut inner.children),
                core::mem::take(&mut inner.wait_list),
                inner.threads.clone(),
            )
        };
        log::info!("process {} ({}) exited: {}", self.id, self.name, status);

        let host = self.host();
        for child in children {
            child.process.orphan();
            if child.exited.is_some() {
                if let Some(host) = &host {
                    host.reap(child.pid());
                }
            }
        }
        for waiter in waiters {
            waiter.wake();
        }
        for thread in threads {
            thread.unpark();
        }

        let reported = match state_tx {
            Some(tx) => match tx.write_all(&ChildEvent::Exited(status).encode()) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("process {}: exit not reported: {}", self.id, e);
                    false
                }
            },
            // Nobody will ever wait for a root process
            None => false,
        };
        if !reported {
            if let Some(host) = &host {
                host.reap(self.id);
            }
        }
        Some(Exited { channel })
    }

    /// Usage reported to the parent on reap: own lifetime plus reaped children
    pub(crate) fn usage(&self) -> ResourceUsage {
        let mut usage = ResourceUsage::from_lifetime(self.lifetime());
        usage.add(&self.inner.lock().children_usage);
        usage
    }
}

/// Handed to the caller that performed the exit
struct Exited {
    /// Channel writer taken off the process when it was unpublished
    channel: Option<PipeWriter>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
