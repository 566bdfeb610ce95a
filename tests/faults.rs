mod common;

use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use common::{attach, host, host_with, wait_status};
use posixrt::interrupts::{DebuggerHook, FaultReport, Registers};
use posixrt::prelude::*;

fn access(addr: u64) -> FaultRecord {
    FaultRecord::new(ExceptionCode::AccessViolation { write: true }, addr)
}

#[test]
fn segv_in_child_is_reported_with_core_bit() {
    let host = host_with("core nodump");
    let _guard = attach(&host, "parent");
    let child = fork(|| {
        let _ = raise_exception(access(0x10));
        0
    })
    .unwrap();
    let status = wait_status(child, 0);
    assert_eq!(status.term_signal(), Some(SIGSEGV));
    assert!(status.core_dumped());
}

#[test]
fn caught_fault_runs_the_handler_on_the_faulting_thread() {
    let host = host();
    let guard = attach(&host, "catcher");
    let code = Arc::new(AtomicI32::new(0));
    {
        let code = code.clone();
        sigaction(
            SIGFPE,
            Some(SignalAction::handler(move |info| {
                code.store(info.code, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }
    let record = FaultRecord {
        registers: Registers {
            ip: 0x401000,
            ..Registers::default()
        },
        ..FaultRecord::new(ExceptionCode::IntegerDivideByZero, 0x401000)
    };
    assert_eq!(raise_exception(record), Ok(FaultOutcome::Handled));
    assert_eq!(code.load(Ordering::SeqCst), FPE_INTDIV);
    assert!(!guard.process().is_exited());
}

#[test]
fn blocked_fault_signal_is_forced_to_its_default() {
    let host = host_with("nocore nodump");
    let _guard = attach(&host, "parent");
    let child = fork(|| {
        let _ = sigaction(SIGSEGV, Some(SignalAction::handler(|_| {})));
        let _ = sigprocmask(SIG_BLOCK, Some(sig_mask(SIGSEGV)));
        let _ = raise_exception(access(0x20));
        0
    })
    .unwrap();
    let status = wait_status(child, 0);
    assert_eq!(status.term_signal(), Some(SIGSEGV));
    assert!(!status.core_dumped());
}

#[test]
fn ignored_fault_signal_is_still_fatal() {
    let host = host_with("nodump");
    let _guard = attach(&host, "parent");
    let child = fork(|| {
        let _ = sigaction(SIGILL, Some(SignalAction::ignore()));
        let _ = raise_exception(FaultRecord::new(ExceptionCode::IllegalInstruction, 0x1234));
        0
    })
    .unwrap();
    assert_eq!(wait_status(child, 0).term_signal(), Some(SIGILL));
}

#[test]
fn memory_map_decides_between_segv_and_bus() {
    let host = host();
    let map = Arc::new(FlatMemoryMap::new());
    map.map(0x10_0000, 0x1000, Backing::Present);
    map.map(0x20_0000, 0x1000, Backing::Gone);
    host.set_memory_map(map);
    let _guard = attach(&host, "mapper");

    let seen = Arc::new(AtomicU64::new(0));
    for sig in [SIGSEGV, SIGBUS] {
        let seen = seen.clone();
        sigaction(
            sig,
            Some(SignalAction::handler(move |info| {
                let packed = ((info.sig() as u64) << 56) | ((info.code as u64) << 48) | info.addr;
                seen.store(packed, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }

    let decode = |v: u64| ((v >> 56) as u32, ((v >> 48) & 0xff) as i32, v & 0xffff_ffff_ffff);
    raise_exception(access(0x10_0800)).unwrap();
    assert_eq!(decode(seen.load(Ordering::SeqCst)), (SIGSEGV, SEGV_ACCERR, 0x10_0800));
    raise_exception(access(0x20_0010)).unwrap();
    assert_eq!(decode(seen.load(Ordering::SeqCst)), (SIGBUS, BUS_ADRERR, 0x20_0010));
    raise_exception(access(0x9000)).unwrap();
    assert_eq!(decode(seen.load(Ordering::SeqCst)), (SIGSEGV, SEGV_MAPERR, 0x9000));
}

#[test]
fn debugger_hook_can_resume_a_fatal_fault() {
    let host = host_with("nodump");
    let calls = Arc::new(AtomicUsize::new(0));
    let hook: DebuggerHook = {
        let calls = calls.clone();
        Arc::new(move |report: &FaultReport| {
            assert_eq!(report.info.sig(), SIGTRAP);
            calls.fetch_add(1, Ordering::SeqCst);
            DebuggerAction::Resume
        })
    };
    host.set_debugger_hook(Some(hook));
    let guard = attach(&host, "debuggee");

    let outcome = raise_exception(FaultRecord::new(ExceptionCode::Breakpoint, 0x400123));
    assert_eq!(outcome, Ok(FaultOutcome::Resumed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!guard.process().is_exited());
}

#[test]
fn fault_inside_a_fault_handler_terminates() {
    let host = host_with("nodump");
    let _guard = attach(&host, "parent");
    let child = fork(|| {
        let _ = sigaction(
            SIGSEGV,
            Some(SignalAction::handler(|_| {
                let _ = raise_exception(FaultRecord::new(ExceptionCode::IllegalInstruction, 0));
            })),
        );
        let _ = raise_exception(access(0x30));
        0
    })
    .unwrap();
    assert_eq!(wait_status(child, 0).term_signal(), Some(SIGILL));
}

#[test]
fn console_interrupt_without_a_terminal_reaches_the_own_group() {
    let host = host();
    let _guard = attach(&host, "console");
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = hits.clone();
        sigaction(
            SIGINT,
            Some(SignalAction::handler(move |info| {
                assert_eq!(info.code, SI_KERNEL);
                hits.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }
    let outcome = raise_exception(FaultRecord::new(ExceptionCode::ConsoleInterrupt, 0));
    assert_eq!(outcome, Ok(FaultOutcome::Forwarded));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
