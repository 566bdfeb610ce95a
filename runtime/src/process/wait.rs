//! Child state tracking and the wait engine
//!
//! Each child reports stop, continue and exit over a small state pipe that
//! a watcher thread in the parent reads. The watcher records the event on
//! the parent's child record, hands it to the first matching waiter,
//! auto-reaps when the parent asked for that, and raises SIGCHLD.

use core::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bitflags::bitflags;
use spin::Mutex;

use super::process::{Process, ProcessId, ProcessInner};
use crate::ipc::pipe::PipeReader;
use crate::signal::channel::{self, Outgoing};
use crate::signal::constants::*;
use crate::signal::delivery;
use crate::signal::packet::SignalPacket;
use crate::signal::types::{SaFlags, SigInfo};
use crate::syscall::errno::Errno;
use crate::task::{Context, Thread, ThreadId};

/// Upper bound on a blocked waiter's sleep between rescans
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Size of one record on a child's state pipe
pub const STATE_RECORD_SIZE: usize = 8;

/// Encoded child status, as returned by `waitpid`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatus(i32);

impl WaitStatus {
    pub const fn exited(code: i32) -> Self {
        WaitStatus((code & 0xff) << 8)
    }

    pub const fn signaled(sig: u32, core: bool) -> Self {
        WaitStatus((sig as i32 & 0x7f) | if core { 0x80 } else { 0 })
    }

    pub const fn stopped(sig: u32) -> Self {
        WaitStatus(((sig as i32 & 0xff) << 8) | 0x7f)
    }

    pub const fn continued() -> Self {
        WaitStatus(0xffff)
    }

    pub const fn from_raw(raw: i32) -> Self {
        WaitStatus(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub fn is_exited(self) -> bool {
        self.0 & 0x7f == 0
    }

    pub fn exit_code(self) -> Option<i32> {
        self.is_exited().then_some((self.0 >> 8) & 0xff)
    }

    pub fn is_signaled(self) -> bool {
        (((self.0 & 0x7f) + 1) as i8 >> 1) > 0
    }

    pub fn term_signal(self) -> Option<u32> {
        self.is_signaled().then_some((self.0 & 0x7f) as u32)
    }

    pub fn core_dumped(self) -> bool {
        self.is_signaled() && self.0 & 0x80 != 0
    }

    pub fn is_stopped(self) -> bool {
        self.0 & 0xff == 0x7f
    }

    pub fn stop_signal(self) -> Option<u32> {
        self.is_stopped().then_some(((self.0 >> 8) & 0xff) as u32)
    }

    pub fn is_continued(self) -> bool {
        self.0 == 0xffff
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.exit_code() {
            write!(f, "exited with {}", code)
        } else if let Some(sig) = self.term_signal() {
            write!(f, "killed by {}", signal_name(sig))?;
            if self.core_dumped() {
                f.write_str(" (core dumped)")?;
            }
            Ok(())
        } else if let Some(sig) = self.stop_signal() {
            write!(f, "stopped by {}", signal_name(sig))
        } else if self.is_continued() {
            f.write_str("continued")
        } else {
            write!(f, "status {:#x}", self.0)
        }
    }
}

/// A state change reported by a child to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    Stopped(u32),
    Continued,
    Exited(WaitStatus),
}

impl ChildEvent {
    const STOPPED: u32 = 1;
    const CONTINUED: u32 = 2;
    const EXITED: u32 = 3;

    pub fn encode(&self) -> [u8; STATE_RECORD_SIZE] {
        let (kind, value) = match *self {
            ChildEvent::Stopped(sig) => (Self::STOPPED, sig as i32),
            ChildEvent::Continued => (Self::CONTINUED, 0),
            ChildEvent::Exited(status) => (Self::EXITED, status.raw()),
        };
        let mut buf = [0u8; STATE_RECORD_SIZE];
        buf[0..4].copy_from_slice(&kind.to_le_bytes());
        buf[4..8].copy_from_slice(&value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; STATE_RECORD_SIZE]) -> Option<ChildEvent> {
        let kind = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let value = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        match kind {
            Self::STOPPED => Some(ChildEvent::Stopped(value as u32)),
            Self::CONTINUED => Some(ChildEvent::Continued),
            Self::EXITED => Some(ChildEvent::Exited(WaitStatus::from_raw(value))),
            _ => None,
        }
    }

    /// SIGCHLD information describing this event
    pub fn sigchld(&self, child: ProcessId) -> SigInfo {
        let (code, value) = match *self {
            ChildEvent::Stopped(sig) => (CLD_STOPPED, sig as u64),
            ChildEvent::Continued => (CLD_CONTINUED, SIGCONT as u64),
            ChildEvent::Exited(status) => match (status.exit_code(), status.term_signal()) {
                (Some(code), _) => (CLD_EXITED, code as u64),
                (None, Some(sig)) if status.core_dumped() => (CLD_DUMPED, sig as u64),
                (None, Some(sig)) => (CLD_KILLED, sig as u64),
                (None, None) => (CLD_EXITED, 0),
            },
        };
        SigInfo {
            signo: SIGCHLD as i32,
            code,
            pid: child.as_u32(),
            value,
            ..Default::default()
        }
    }
}

bitflags! {
    /// `waitpid` options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WaitOptions: u32 {
        const WNOHANG = 0x0000_0001;
        const WUNTRACED = 0x0000_0002;
        const WEXITED = 0x0000_0004;
        const WCONTINUED = 0x0000_0008;
        /// Report without consuming the event
        const WNOWAIT = 0x0100_0000;
    }
}

impl WaitOptions {
    /// Parse raw option bits; unknown bits are `EINVAL`
    pub fn from_raw(bits: u32) -> Result<WaitOptions, Errno> {
        WaitOptions::from_bits(bits).ok_or(Errno::EINVAL)
    }
}

/// Which children a wait is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitFilter {
    #[default]
    Any,
    Pid(ProcessId),
    /// Children in the caller's own process group
    OwnGroup,
    Group(ProcessId),
}

impl WaitFilter {
    /// Interpret a `waitpid` pid argument
    pub fn from_pid(pid: i32) -> WaitFilter {
        match pid {
            -1 => WaitFilter::Any,
            0 => WaitFilter::OwnGroup,
            p if p > 0 => WaitFilter::Pid(ProcessId::new(p as u32)),
            p => WaitFilter::Group(ProcessId::new(p.unsigned_abs())),
        }
    }

    pub fn matches(&self, pid: ProcessId, pgid: ProcessId, own_pgid: ProcessId) -> bool {
        match *self {
            WaitFilter::Any => true,
            WaitFilter::Pid(want) => pid == want,
            WaitFilter::OwnGroup => pgid == own_pgid,
            WaitFilter::Group(want) => pgid == want,
        }
    }
}

/// Approximate resource usage
///
/// The host gives no per-thread CPU accounting, so user time is the wall
/// clock lifetime of the process and system time is always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceUsage {
    pub utime: Duration,
    pub stime: Duration,
    /// Descendants reaped and folded into this usage
    pub children: u32,
}

impl ResourceUsage {
    pub fn from_lifetime(lifetime: Duration) -> Self {
        ResourceUsage {
            utime: lifetime,
            stime: Duration::ZERO,
            children: 0,
        }
    }

    pub fn add(&mut self, other: &ResourceUsage) {
        self.utime += other.utime;
        self.stime += other.stime;
        self.children += other.children;
    }

    /// Fold in the usage of one reaped child
    pub fn add_reaped(&mut self, child: &ResourceUsage) {
        self.add(child);
        self.children += 1;
    }
}

/// What a successful wait returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitResult {
    pub pid: ProcessId,
    pub status: WaitStatus,
    pub usage: ResourceUsage,
}

/// Parent's record of one child
pub struct ChildRecord {
    pub process: Arc<Process>,
    /// Unconsumed stop or continue
    pub event: Option<ChildEvent>,
    /// Set once the child exits; the record is a zombie until reaped
    pub exited: Option<WaitStatus>,
}

impl ChildRecord {
    pub fn new(process: Arc<Process>) -> Self {
        ChildRecord {
            process,
            event: None,
            exited: None,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.process.id
    }

    fn apply(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Exited(status) => {
                self.exited = Some(status);
                self.event = None;
            }
            other => self.event = Some(other),
        }
    }

    /// Status `options` would report for this child right now
    fn report(&self, options: WaitOptions) -> Option<WaitStatus> {
        if let Some(status) = self.exited {
            return options.contains(WaitOptions::WEXITED).then_some(status);
        }
        match self.event {
            Some(ChildEvent::Stopped(sig)) if options.contains(WaitOptions::WUNTRACED) => {
                Some(WaitStatus::stopped(sig))
            }
            Some(ChildEvent::Continued) if options.contains(WaitOptions::WCONTINUED) => {
                Some(WaitStatus::continued())
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct WaitSlot {
    filter: WaitFilter,
    options: WaitOptions,
    result: Option<WaitResult>,
}

/// A thread blocked in `wait`, linked on its process's wait list
pub struct WaitQueueEntry {
    pub tid: ThreadId,
    thread: Weak<Thread>,
    slot: Mutex<WaitSlot>,
}

impl WaitQueueEntry {
    pub(crate) fn new(tid: ThreadId, thread: Weak<Thread>) -> Self {
        WaitQueueEntry {
            tid,
            thread,
            slot: Mutex::new(WaitSlot::default()),
        }
    }

    fn prepare(&self, filter: WaitFilter, options: WaitOptions) {
        *self.slot.lock() = WaitSlot {
            filter,
            options,
            result: None,
        };
    }

    fn params(&self) -> (WaitFilter, WaitOptions) {
        let slot = self.slot.lock();
        (slot.filter, slot.options)
    }

    fn hand_over(&self, result: WaitResult) {
        self.slot.lock().result = Some(result);
        self.wake();
    }

    fn take_result(&self) -> Option<WaitResult> {
        self.slot.lock().result.take()
    }

    pub(crate) fn wake(&self) {
        if let Some(thread) = self.thread.upgrade() {
            thread.unpark();
        }
    }
}

fn unlink(inner: &mut ProcessInner, entry: &Arc<WaitQueueEntry>) {
    inner.wait_list.retain(|e| !Arc::ptr_eq(e, entry));
}

/// Take the report for child `idx`. Returns the pid to reap when the
/// record was consumed.
fn collect(
    inner: &mut ProcessInner,
    idx: usize,
    status: WaitStatus,
    options: WaitOptions,
) -> (WaitResult, Option<ProcessId>) {
    let consume = !options.contains(WaitOptions::WNOWAIT);
    let pid = inner.children[idx].pid();
    if inner.children[idx].exited.is_some() {
        let usage = inner.children[idx].process.usage();
        let result = WaitResult { pid, status, usage };
        if consume {
            inner.children.remove(idx);
            inner.children_usage.add_reaped(&usage);
            return (result, Some(pid));
        }
        return (result, None);
    }
    if consume {
        inner.children[idx].event = None;
    }
    let result = WaitResult {
        pid,
        status,
        usage: ResourceUsage::default(),
    };
    (result, None)
}

/// Record a child's state change on its parent
pub(crate) fn notify_state_change(parent: &Arc<Process>, child: &Arc<Process>, event: ChildEvent) {
    let mut reap = None;
    let sigchld = {
        let mut inner = parent.lock();
        let idx = inner.children.iter().position(|r| Arc::ptr_eq(&r.process, child));
        let idx = match idx {
            Some(idx) if inner.state != super::ProcessState::Exited => idx,
            // Parent gone or record dropped; nobody will wait for this child
            _ => {
                drop(inner);
                if matches!(event, ChildEvent::Exited(_)) {
                    if let Some(host) = child.host() {
                        host.reap(child.id);
                    }
                }
                return;
            }
        };
        inner.children[idx].apply(event);

        let action = inner.dispositions.get(SIGCHLD);
        let exited = matches!(event, ChildEvent::Exited(_));
        if exited && (action.is_ignore() || action.flags.contains(SaFlags::NOCLDWAIT)) {
            let record = inner.children.remove(idx);
            inner.children_usage.add_reaped(&record.process.usage());
            reap = Some(record.pid());
            log::debug!("process {}: auto-reaped child {}", parent.id, record.pid());
            // Waiters rescan and may now find no children at all
            for waiter in &inner.wait_list {
                waiter.wake();
            }
        } else {
            let own_pgid = inner.pgid;
            let child_pgid = child.pgid();
            let record = &inner.children[idx];
            let waiter = inner.wait_list.iter().position(|w| {
                let (filter, options) = w.params();
                filter.matches(record.pid(), child_pgid, own_pgid) && record.report(options).is_some()
            });
            if let Some(w) = waiter {
                let entry = inner.wait_list.remove(w);
                let (_, options) = entry.params();
                if let Some(status) = inner.children[idx].report(options) {
                    let (result, consumed) = collect(&mut inner, idx, status, options);
                    reap = consumed;
                    entry.hand_over(result);
                }
            }
        }

        let wanted = match event {
            ChildEvent::Exited(_) => true,
            _ => !action.flags.contains(SaFlags::NOCLDSTOP),
        };
        (wanted && !action.is_ignore()).then(|| event.sigchld(child.id))
    };

    if let Some(pid) = reap {
        if let Some(host) = parent.host() {
            host.reap(pid);
        }
    }
    if let Some(info) = sigchld {
        let packet = SignalPacket::signal(info, child.id.as_u32());
        if let Err(e) = channel::send(Some(parent), parent, Outgoing::new(packet)) {
            log::debug!("process {}: SIGCHLD not sent: {}", parent.id, e);
        }
    }
}

/// Start the thread that reads `child`'s state pipe on behalf of `parent`
pub(crate) fn spawn_watcher(parent: &Arc<Process>, child: &Arc<Process>, reader: PipeReader) -> Result<(), Errno> {
    let parent_id = parent.id;
    let parent = parent.clone();
    let watched = child.clone();
    std::thread::Builder::new()
        .name(format!("wait-{}", child.id))
        .spawn(move || {
            let mut buf = [0u8; STATE_RECORD_SIZE];
            loop {
                if let Err(e) = reader.read_exact(&mut buf) {
                    log::warn!("child {}: state pipe closed without exit: {}", watched.id, e);
                    break;
                }
                match ChildEvent::decode(&buf) {
                    Some(event) => {
                        log::debug!("child {} of {}: {:?}", watched.id, parent.id, event);
                        notify_state_change(&parent, &watched, event);
                        if matches!(event, ChildEvent::Exited(_)) {
                            break;
                        }
                    }
                    None => log::warn!("child {}: malformed state record", watched.id),
                }
            }
        })
        .map(|_| ())
        .map_err(|e| {
            log::error!("process {}: cannot start watcher for {}: {}", parent_id, child.id, e);
            Errno::EAGAIN
        })
}

/// Wait for a child of the calling process to change state
///
/// `Ok(None)` only with `WNOHANG`. A caught signal interrupts the wait with
/// `EINTR` unless its action has `SA_RESTART`.
pub fn wait_child(ctx: &Context, filter: WaitFilter, options: WaitOptions) -> Result<Option<WaitResult>, Errno> {
    let entry = ctx.thread.wait_entry();
    loop {
        // Handlers only run through here so every one of them ends or
        // restarts the wait
        delivery::stop_gate(ctx);
        if let Some(outcome) = interruption(ctx, &entry) {
            return outcome;
        }
        let token = ctx.thread.token();

        let (found, reap) = {
            let _section = ctx.enter_runtime();
            let mut inner = ctx.process.lock();
            if let Some(result) = entry.take_result() {
                unlink(&mut inner, &entry);
                return Ok(Some(result));
            }
            let own_pgid = inner.pgid;
            let mut matched = false;
            let mut found = None;
            for (idx, record) in inner.children.iter().enumerate() {
                if !filter.matches(record.pid(), record.process.pgid(), own_pgid) {
                    continue;
                }
                matched = true;
                if let Some(status) = record.report(options) {
                    found = Some((idx, status));
                    break;
                }
            }
            if !matched {
                unlink(&mut inner, &entry);
                return Err(Errno::ECHILD);
            }
            match found {
                Some((idx, status)) => {
                    unlink(&mut inner, &entry);
                    let (result, reap) = collect(&mut inner, idx, status, options);
                    (Some(result), reap)
                }
                None if options.contains(WaitOptions::WNOHANG) => {
                    unlink(&mut inner, &entry);
                    return Ok(None);
                }
                None => {
                    entry.prepare(filter, options);
                    if !inner.wait_list.iter().any(|e| Arc::ptr_eq(e, &entry)) {
                        inner.wait_list.push(entry.clone());
                    }
                    (None, None)
                }
            }
        };

        if let Some(result) = found {
            if let (Some(pid), Some(host)) = (reap, ctx.process.host()) {
                host.reap(pid);
            }
            return Ok(Some(result));
        }

        if !ctx.thread.has_armed() {
            ctx.thread.park(token, WAIT_POLL);
        }
    }
}

/// Run a handler armed during a wait. `Some` ends the wait: with a result
/// that was handed over first, or with `EINTR` unless the handler asked
/// for a restart.
fn interruption(ctx: &Context, entry: &Arc<WaitQueueEntry>) -> Option<Result<Option<WaitResult>, Errno>> {
    let flags = ctx.thread.armed_flags()?;
    {
        let mut inner = ctx.process.lock();
        unlink(&mut inner, entry);
        if let Some(result) = entry.take_result() {
            return Some(Ok(Some(result)));
        }
    }
    delivery::deliver(ctx);
    if flags.contains(SaFlags::RESTART) {
        None
    } else {
        Some(Err(Errno::EINTR))
    }
}
