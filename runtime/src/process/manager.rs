//! Host and process manager
//!
//! A [`Host`] is one self-contained world of emulated processes: a process
//! table, the terminals they share and the pieces of configuration every
//! process inherits. Hosts are independent of each other; tests typically
//! create one per test.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use spin::Mutex;

use super::fork;
use super::process::{Process, ProcessId, ProcessSetup};
use super::services::ProcessServices;
use super::wait::WaitStatus;
use crate::config::RuntimeConfig;
use crate::interrupts::exception::{DebuggerHook, FlatMemoryMap, MemoryMap};
use crate::logger;
use crate::signal::channel::{self, Outgoing, SendError};
use crate::signal::constants::*;
use crate::signal::interrupt::{CooperativeBackend, InterruptBackend};
use crate::signal::packet::SignalPacket;
use crate::signal::types::{Dispositions, SigInfo};
use crate::syscall::errno::Errno;
use crate::task::{self, Context, Thread, ThreadId};

/// Terminal identifier
pub type TtyId = u32;

/// A terminal that can be some session's controlling terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    pub id: TtyId,
    /// Session leader that owns the terminal
    pub session: Option<ProcessId>,
    pub foreground: Option<ProcessId>,
}

/// Process manager handles all processes of a host
struct ProcessManager {
    /// All processes indexed by PID
    processes: BTreeMap<ProcessId, Arc<Process>>,

    /// Next available PID; thread ids share this space
    next_pid: u32,

    torn_down: bool,
}

impl ProcessManager {
    fn new() -> Self {
        ProcessManager {
            processes: BTreeMap::new(),
            // 1 is reserved for the reparenting target
            next_pid: 2,
            torn_down: false,
        }
    }
}

pub struct Host {
    config: Arc<RuntimeConfig>,
    backend: Arc<dyn InterruptBackend>,
    manager: Mutex<ProcessManager>,
    terminals: Mutex<BTreeMap<TtyId, Terminal>>,
    next_tty: AtomicU32,
    memory_map: Mutex<Arc<dyn MemoryMap>>,
    debugger: Mutex<Option<DebuggerHook>>,
}

impl Host {
    /// Create a host using the cooperative interrupt backend
    pub fn new(config: RuntimeConfig) -> Arc<Host> {
        Self::with_backend(config, Arc::new(CooperativeBackend))
    }

    pub fn with_backend(config: RuntimeConfig, backend: Arc<dyn InterruptBackend>) -> Arc<Host> {
        logger::init();
        log::debug!("host created with {} interrupt backend", backend.name());
        Arc::new(Host {
            config: Arc::new(config),
            backend,
            manager: Mutex::new(ProcessManager::new()),
            terminals: Mutex::new(BTreeMap::new()),
            next_tty: AtomicU32::new(0),
            memory_map: Mutex::new(Arc::new(FlatMemoryMap::new())),
            debugger: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> Arc<RuntimeConfig> {
        self.config.clone()
    }

    pub(crate) fn backend(&self) -> Arc<dyn InterruptBackend> {
        self.backend.clone()
    }

    /// Allocate an id from the shared pid/tid space
    pub(crate) fn allocate_id(&self) -> Result<u32, Errno> {
        let mut manager = self.manager.lock();
        if manager.torn_down {
            return Err(Errno::EAGAIN);
        }
        let id = manager.next_pid;
        manager.next_pid = manager.next_pid.checked_add(1).ok_or(Errno::EAGAIN)?;
        Ok(id)
    }

    pub(crate) fn insert(&self, process: Arc<Process>) -> Result<(), Errno> {
        let mut manager = self.manager.lock();
        if manager.torn_down {
            return Err(Errno::EAGAIN);
        }
        manager.processes.insert(process.id, process);
        Ok(())
    }

    /// Drop a process from the table; its pid is never reused
    pub(crate) fn reap(&self, pid: ProcessId) {
        if self.manager.lock().processes.remove(&pid).is_some() {
            log::debug!("process {} reaped", pid);
        }
    }

    pub fn get_process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.manager.lock().processes.get(&pid).cloned()
    }

    /// Every process in the table, including unreaped zombies
    pub fn all_processes(&self) -> Vec<Arc<Process>> {
        self.manager.lock().processes.values().cloned().collect()
    }

    pub fn process_count(&self) -> usize {
        self.manager.lock().processes.len()
    }

    /// Live members of process group `pgid`
    pub fn process_group(&self, pgid: ProcessId) -> Vec<Arc<Process>> {
        self.all_processes()
            .into_iter()
            .filter(|p| !p.is_exited() && p.pgid() == pgid)
            .collect()
    }

    /// True if some live process of session `sid` leads or belongs to group `pgid`
    pub fn session_has_group(&self, sid: ProcessId, pgid: ProcessId) -> bool {
        self.process_group(pgid).iter().any(|p| p.sid() == sid)
    }

    /// Register the calling OS thread as the main thread of a new root process
    ///
    /// Dropping the guard exits the process with status 0. If the process is
    /// killed while attached, the next runtime call on this thread unwinds
    /// with [`task::ProcessExit`].
    pub fn attach(self: &Arc<Self>, name: &str, services: Arc<dyn ProcessServices>) -> Result<AttachGuard, Errno> {
        if task::current().is_some() {
            return Err(Errno::EPERM);
        }
        let pid = ProcessId::new(self.allocate_id()?);
        let process = Arc::new(Process::new(
            pid,
            self,
            ProcessSetup {
                name: name.to_string(),
                parent: None,
                pgid: pid,
                sid: pid,
                ctty: None,
                dispositions: Dispositions::default(),
                services,
                held: false,
            },
        ));
        self.insert(process.clone())?;
        let thread = Arc::new(Thread::new(pid.as_u32(), name, 0));
        process.add_thread(thread.clone())?;
        if let Err(e) = fork::launch(&process) {
            self.reap(pid);
            return Err(e);
        }
        task::set_current(Some(Context::new(process.clone(), thread.clone())));
        log::info!("process {} ({}) attached", pid, name);
        Ok(AttachGuard { process, thread })
    }

    /// Send `info` to `target` on behalf of `sender`, waiting for the
    /// dispatcher to take it. Signal 0 only checks that `target` exists.
    pub fn send_signal(
        &self,
        sender: Option<&Arc<Process>>,
        target: &Arc<Process>,
        info: SigInfo,
        tid: ThreadId,
    ) -> Result<(), Errno> {
        if target.is_exited() {
            return Err(Errno::ESRCH);
        }
        if info.sig() == 0 {
            return Ok(());
        }
        let mut packet = SignalPacket::signal(info, sender.map(|p| p.id.as_u32()).unwrap_or(0));
        packet.target_tid = tid;
        match channel::send(sender, target, Outgoing::new(packet).wait()) {
            Ok(()) => Ok(()),
            // Already logged; the packet is queued and will be seen
            Err(SendError::CompletionTimeout) => Ok(()),
            Err(SendError::NoProcess) => Err(Errno::ESRCH),
        }
    }

    /// Send `info` to every live member of group `pgid`
    pub fn signal_group(&self, sender: Option<&Arc<Process>>, pgid: ProcessId, info: SigInfo) -> Result<(), Errno> {
        let members = self.process_group(pgid);
        if members.is_empty() {
            return Err(Errno::ESRCH);
        }
        let mut delivered = false;
        for member in &members {
            delivered |= self.send_signal(sender, member, info, 0).is_ok();
        }
        if delivered {
            Ok(())
        } else {
            Err(Errno::ESRCH)
        }
    }

    pub fn create_terminal(&self) -> TtyId {
        let id = self.next_tty.fetch_add(1, Ordering::Relaxed);
        self.terminals.lock().insert(
            id,
            Terminal {
                id,
                session: None,
                foreground: None,
            },
        );
        id
    }

    pub fn terminal(&self, id: TtyId) -> Option<Terminal> {
        self.terminals.lock().get(&id).cloned()
    }

    pub(crate) fn update_terminal<R>(&self, id: TtyId, f: impl FnOnce(&mut Terminal) -> R) -> Option<R> {
        self.terminals.lock().get_mut(&id).map(f)
    }

    /// Console interrupt on `tty`: SIGINT to the foreground group and a
    /// flush of unread input
    pub fn console_interrupt(&self, tty: TtyId) -> Result<(), Errno> {
        let terminal = self.terminal(tty).ok_or(Errno::EINVAL)?;
        let foreground = terminal.foreground.ok_or(Errno::ESRCH)?;
        log::info!("tty {}: interrupt for group {}", tty, foreground);
        if let Some(leader) = terminal.session.and_then(|sid| self.get_process(sid)) {
            leader.services().flush_tty_input();
        }
        self.signal_group(None, foreground, SigInfo::kernel(SIGINT, SI_KERNEL))
    }

    pub fn set_memory_map(&self, map: Arc<dyn MemoryMap>) {
        *self.memory_map.lock() = map;
    }

    pub fn memory_map(&self) -> Arc<dyn MemoryMap> {
        self.memory_map.lock().clone()
    }

    /// Programmatic stand-in for the `error_start` debugger
    pub fn set_debugger_hook(&self, hook: Option<DebuggerHook>) {
        *self.debugger.lock() = hook;
    }

    pub fn debugger_hook(&self) -> Option<DebuggerHook> {
        self.debugger.lock().clone()
    }

    /// Kill every process and refuse new ones
    pub fn teardown(&self) {
        let processes: Vec<Arc<Process>> = {
            let mut manager = self.manager.lock();
            manager.torn_down = true;
            manager.processes.values().cloned().collect()
        };
        if !processes.is_empty() {
            log::debug!("host teardown: killing {} processes", processes.len());
        }
        for process in &processes {
            process.terminate(WaitStatus::signaled(SIGKILL, false));
        }
        self.manager.lock().processes.clear();
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// The calling thread's membership in an attached root process
pub struct AttachGuard {
    process: Arc<Process>,
    thread: Arc<Thread>,
}

impl AttachGuard {
    pub fn pid(&self) -> ProcessId {
        self.process.id
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.process.terminate(WaitStatus::exited(0));
        self.thread.mark_exited();
        self.process.remove_thread(self.thread.tid);
        let ours = task::current().is_some_and(|c| Arc::ptr_eq(&c.thread, &self.thread));
        if ours {
            task::set_current(None);
        }
    }
}
