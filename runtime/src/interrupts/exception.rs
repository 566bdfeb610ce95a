//! Exception translation
//!
//! A hardware exception on a POSIX thread becomes a synchronous signal on
//! that same thread. If the signal is caught and not blocked, its handler
//! runs immediately. Otherwise the fault is fatal: the default action is
//! forced even when the signal is blocked or ignored, a crash dump is
//! logged, the configured debugger gets a look, and the process dies.

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::sync::Arc;

use spin::Mutex;

use crate::log_buffer;
use crate::process::{Host, WaitStatus};
use crate::signal::constants::*;
use crate::signal::delivery;
use crate::signal::trampoline;
use crate::signal::types::{SaFlags, SigInfo, SignalAction};
use crate::syscall::errno::Errno;
use crate::task::{self, unwind_exit, ArmedSignal, Context};

/// Lines of recent log included in a crash dump
const DUMP_LOG_LINES: usize = 32;

thread_local! {
    static IN_FAULT: Cell<bool> = const { Cell::new(false) };
}

/// Host exception kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalInstruction,
    PrivilegedInstruction,
    IntegerDivideByZero,
    IntegerOverflow,
    FloatDivideByZero,
    FloatOverflow,
    FloatUnderflow,
    FloatInexact,
    FloatInvalid,
    AccessViolation { write: bool },
    /// Backing store for a mapped page could not be read
    InPageError,
    Misaligned,
    StackOverflow,
    Breakpoint,
    SingleStep,
    /// Ctrl-C from the console; routed asynchronously
    ConsoleInterrupt,
}

/// Register state at the fault
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub code: ExceptionCode,
    /// Faulting data address, or the instruction address for non-memory faults
    pub address: u64,
    pub registers: Registers,
}

impl FaultRecord {
    pub fn new(code: ExceptionCode, address: u64) -> Self {
        FaultRecord {
            code,
            address,
            registers: Registers::default(),
        }
    }
}

/// How an address relates to the emulated address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Unmapped,
    /// Mapped, but the access was not permitted
    Protected,
    /// Mapped, but its backing store is gone
    Inaccessible,
}

pub trait MemoryMap: Send + Sync {
    fn classify(&self, addr: u64) -> Region;
}

/// State of a mapped range's backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Present,
    Gone,
}

#[derive(Debug, Clone, Copy)]
struct MappedRange {
    start: u64,
    len: u64,
    backing: Backing,
}

/// A list of mapped ranges; everything else is unmapped
#[derive(Debug, Default)]
pub struct FlatMemoryMap {
    ranges: Mutex<Vec<MappedRange>>,
}

impl FlatMemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, start: u64, len: u64, backing: Backing) {
        self.ranges.lock().push(MappedRange { start, len, backing });
    }

    pub fn unmap(&self, start: u64) {
        self.ranges.lock().retain(|r| r.start != start);
    }
}

impl MemoryMap for FlatMemoryMap {
    fn classify(&self, addr: u64) -> Region {
        let ranges = self.ranges.lock();
        match ranges.iter().find(|r| addr >= r.start && addr - r.start < r.len) {
            None => Region::Unmapped,
            Some(r) if r.backing == Backing::Gone => Region::Inaccessible,
            Some(_) => Region::Protected,
        }
    }
}

/// Signal information for a fault
pub fn translate(record: &FaultRecord, map: &dyn MemoryMap) -> SigInfo {
    let (sig, code) = match record.code {
        ExceptionCode::IllegalInstruction => (SIGILL, ILL_ILLOPC),
        ExceptionCode::PrivilegedInstruction => (SIGILL, ILL_PRVOPC),
        ExceptionCode::IntegerDivideByZero => (SIGFPE, FPE_INTDIV),
        ExceptionCode::IntegerOverflow => (SIGFPE, FPE_INTOVF),
        ExceptionCode::FloatDivideByZero => (SIGFPE, FPE_FLTDIV),
        ExceptionCode::FloatOverflow => (SIGFPE, FPE_FLTOVF),
        ExceptionCode::FloatUnderflow => (SIGFPE, FPE_FLTUND),
        ExceptionCode::FloatInexact => (SIGFPE, FPE_FLTRES),
        ExceptionCode::FloatInvalid => (SIGFPE, FPE_FLTINV),
        ExceptionCode::AccessViolation { .. } => match map.classify(record.address) {
            Region::Unmapped => (SIGSEGV, SEGV_MAPERR),
            Region::Protected => (SIGSEGV, SEGV_ACCERR),
            Region::Inaccessible => (SIGBUS, BUS_ADRERR),
        },
        ExceptionCode::InPageError => (SIGBUS, BUS_ADRERR),
        ExceptionCode::Misaligned => (SIGBUS, BUS_ADRALN),
        ExceptionCode::StackOverflow => (SIGSEGV, SEGV_MAPERR),
        ExceptionCode::Breakpoint => (SIGTRAP, TRAP_BRKPT),
        ExceptionCode::SingleStep => (SIGTRAP, TRAP_TRACE),
        ExceptionCode::ConsoleInterrupt => (SIGINT, SI_KERNEL),
    };
    let mut info = SigInfo::kernel(sig, code);
    info.addr = record.address;
    info
}

/// What became of a raised exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A handler ran and returned
    Handled,
    /// A debugger hook chose to resume
    Resumed,
    /// Console interrupt passed on to the foreground group
    Forwarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerAction {
    Resume,
    Terminate,
}

/// In-process replacement for the `error_start` debugger command
pub type DebuggerHook = Arc<dyn Fn(&FaultReport) -> DebuggerAction + Send + Sync>;

/// Everything logged about a fatal fault
#[derive(Debug, Clone)]
pub struct FaultReport {
    pub pid: u32,
    pub tid: u32,
    pub info: SigInfo,
    pub record: FaultRecord,
    pub backtrace: String,
    pub recent_log: Vec<String>,
}

impl FaultReport {
    fn capture(ctx: &Context, record: &FaultRecord, info: SigInfo) -> Self {
        FaultReport {
            pid: ctx.process.id.as_u32(),
            tid: ctx.thread.tid,
            info,
            record: *record,
            backtrace: Backtrace::force_capture().to_string(),
            recent_log: log_buffer::tail(DUMP_LOG_LINES),
        }
    }

    fn log(&self) {
        log::error!(
            "EXCEPTION: {:?} in process {} thread {}",
            self.record.code,
            self.pid,
            self.tid
        );
        log::error!(
            "Signal: {} code {} address {:#x}",
            signal_name(self.info.sig()),
            self.info.code,
            self.info.addr
        );
        log::error!("{:#?}", self.record.registers);
        log::error!("Backtrace:\n{}", self.backtrace);
        if !self.recent_log.is_empty() {
            log::error!("Recent log:\n{}", self.recent_log.join("\n"));
        }
    }
}

struct FaultGuard;

impl FaultGuard {
    fn enter() -> Option<FaultGuard> {
        IN_FAULT.with(|f| (!f.replace(true)).then_some(FaultGuard))
    }
}

impl Drop for FaultGuard {
    fn drop(&mut self) {
        IN_FAULT.with(|f| f.set(false));
    }
}

/// Raise a host exception on the calling thread
///
/// Returns only if a handler ran, a debugger resumed, or the exception was
/// a console interrupt. A fatal fault terminates the process and unwinds
/// the calling thread.
pub fn raise_exception(record: FaultRecord) -> Result<FaultOutcome, Errno> {
    let ctx = task::require_current()?;
    let host = ctx.process.host().ok_or(Errno::ESRCH)?;
    let info = translate(&record, host.memory_map().as_ref());
    let sig = info.sig();

    let Some(guard) = FaultGuard::enter() else {
        log::error!(
            "process {}: {:?} while handling a fault",
            ctx.process.id,
            record.code
        );
        die(&ctx, sig);
    };

    if record.code == ExceptionCode::ConsoleInterrupt {
        drop(guard);
        forward_console_interrupt(&ctx, &host)?;
        delivery::deliver(&ctx);
        return Ok(FaultOutcome::Forwarded);
    }

    delivery::deliver(&ctx);

    let blocked = ctx.thread.lock_state().is_blocked(sig);
    let action = {
        let mut inner = ctx.process.lock();
        let action = inner.dispositions.get(sig);
        if !blocked && action.is_user_handler() && action.flags.contains(SaFlags::RESETHAND) {
            inner.dispositions.set(sig, SignalAction::default());
        }
        action
    };

    if !blocked && action.is_user_handler() {
        log::debug!(
            "process {} thread {}: {:?} delivered as {}",
            ctx.process.id,
            ctx.thread.tid,
            record.code,
            signal_name(sig)
        );
        trampoline::invoke(&ctx, ArmedSignal::new(info, action));
        return Ok(FaultOutcome::Handled);
    }

    let report = FaultReport::capture(&ctx, &record, info);
    if ctx.process.config().dump_on_fault {
        report.log();
    }
    if run_debugger(&ctx, &host, &report) == DebuggerAction::Resume {
        log::info!("process {}: debugger resumed after {:?}", ctx.process.id, record.code);
        return Ok(FaultOutcome::Resumed);
    }
    drop(guard);
    die(&ctx, sig)
}

fn die(ctx: &Context, sig: u32) -> ! {
    let core = ctx.process.config().core_dumps;
    ctx.process.terminate(WaitStatus::signaled(sig, core));
    unwind_exit()
}

fn forward_console_interrupt(ctx: &Context, host: &Arc<Host>) -> Result<(), Errno> {
    match ctx.process.ctty() {
        Some(tty) => host.console_interrupt(tty),
        None => host.signal_group(
            Some(&ctx.process),
            ctx.process.pgid(),
            SigInfo::kernel(SIGINT, SI_KERNEL),
        ),
    }
}

fn run_debugger(ctx: &Context, host: &Host, report: &FaultReport) -> DebuggerAction {
    if let Some(hook) = host.debugger_hook() {
        return hook(report);
    }
    if let Some(command) = &ctx.process.config().error_start {
        let mut parts = command.split_whitespace();
        if let Some(program) = parts.next() {
            let status = std::process::Command::new(program)
                .args(parts)
                .arg(ctx.process.id.to_string())
                .status();
            match status {
                Ok(status) => log::info!("error_start '{}' finished: {}", command, status),
                Err(e) => log::error!("error_start '{}' failed: {}", command, e),
            }
        }
    }
    DebuggerAction::Terminate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: ExceptionCode, address: u64) -> FaultRecord {
        FaultRecord::new(code, address)
    }

    #[test]
    fn access_violations_follow_the_memory_map() {
        let map = FlatMemoryMap::new();
        map.map(0x1000, 0x1000, Backing::Present);
        map.map(0x8000, 0x1000, Backing::Gone);
        let access = ExceptionCode::AccessViolation { write: true };

        let info = translate(&record(access, 0x10), &map);
        assert_eq!((info.sig(), info.code, info.addr), (SIGSEGV, SEGV_MAPERR, 0x10));
        let info = translate(&record(access, 0x1800), &map);
        assert_eq!((info.sig(), info.code), (SIGSEGV, SEGV_ACCERR));
        let info = translate(&record(access, 0x8004), &map);
        assert_eq!((info.sig(), info.code), (SIGBUS, BUS_ADRERR));

        map.unmap(0x1000);
        assert_eq!(translate(&record(access, 0x1800), &map).code, SEGV_MAPERR);
    }

    #[test]
    fn arithmetic_and_trap_codes() {
        let map = FlatMemoryMap::new();
        let cases = [
            (ExceptionCode::IntegerDivideByZero, SIGFPE, FPE_INTDIV),
            (ExceptionCode::FloatInvalid, SIGFPE, FPE_FLTINV),
            (ExceptionCode::IllegalInstruction, SIGILL, ILL_ILLOPC),
            (ExceptionCode::PrivilegedInstruction, SIGILL, ILL_PRVOPC),
            (ExceptionCode::Misaligned, SIGBUS, BUS_ADRALN),
            (ExceptionCode::StackOverflow, SIGSEGV, SEGV_MAPERR),
            (ExceptionCode::Breakpoint, SIGTRAP, TRAP_BRKPT),
            (ExceptionCode::SingleStep, SIGTRAP, TRAP_TRACE),
        ];
        for (code, sig, si_code) in cases {
            let info = translate(&record(code, 0x400000), &map);
            assert_eq!((info.sig(), info.code), (sig, si_code), "{:?}", code);
        }
    }

    #[test]
    fn fault_guard_refuses_reentry() {
        let outer = FaultGuard::enter();
        assert!(outer.is_some());
        assert!(FaultGuard::enter().is_none());
        drop(outer);
        assert!(FaultGuard::enter().is_some());
    }

    #[test]
    fn raising_without_a_process_is_esrch() {
        let result = raise_exception(record(ExceptionCode::Breakpoint, 0));
        assert_eq!(result, Err(Errno::ESRCH));
    }
}
