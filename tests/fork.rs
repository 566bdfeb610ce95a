mod common;

use std::sync::Arc;

use common::{arg, attach, host, host_with, idle, wait_status};
use posixrt::prelude::*;

#[test]
fn child_inherits_mask_and_dispositions_but_not_pending() {
    let host = host();
    let _guard = attach(&host, "parent");
    sigaction(SIGTERM, Some(SignalAction::ignore())).unwrap();
    sigaction(SIGUSR1, Some(SignalAction::handler(|_| {}))).unwrap();
    sigprocmask(SIG_BLOCK, Some(sig_mask(SIGUSR2))).unwrap();
    raise(SIGUSR2).unwrap();
    assert_eq!(sigpending().unwrap(), sig_mask(SIGUSR2));

    let child = fork(|| {
        let mut failures = 0;
        if sigprocmask(SIG_BLOCK, None) != Ok(sig_mask(SIGUSR2)) {
            failures |= 1;
        }
        if !sigaction(SIGTERM, None).is_ok_and(|a| a.is_ignore()) {
            failures |= 2;
        }
        if !sigaction(SIGUSR1, None).is_ok_and(|a| a.is_user_handler()) {
            failures |= 4;
        }
        if sigpending() != Ok(0) {
            failures |= 8;
        }
        failures
    })
    .unwrap();
    assert_eq!(wait_status(child, 0).exit_code(), Some(0));

    sigaction(SIGUSR2, Some(SignalAction::ignore())).unwrap();
}

#[test]
fn spawn_resets_caught_handlers_and_keeps_ignored_ones() {
    let host = host();
    let _guard = attach(&host, "sh");
    sigaction(SIGUSR1, Some(SignalAction::handler(|_| {}))).unwrap();
    sigaction(SIGHUP, Some(SignalAction::ignore())).unwrap();

    let child = spawn(&["ls", "-l"], || {
        let reset = sigaction(SIGUSR1, None).is_ok_and(|a| a.is_default());
        let kept = sigaction(SIGHUP, None).is_ok_and(|a| a.is_ignore());
        let argv = getpid().and_then(proc_cmdline);
        if reset && kept && argv == Ok(vec![String::from("ls"), String::from("-l")]) {
            0
        } else {
            1
        }
    })
    .unwrap();
    assert_eq!(wait_status(child, 0).exit_code(), Some(0));
}

#[test]
fn child_sees_its_parent_until_the_parent_exits() {
    let host = host();
    let guard = attach(&host, "parent");
    let parent = guard.pid();
    let child = fork(move || if getppid() == Ok(parent) { 0 } else { 1 }).unwrap();
    assert_eq!(wait_status(child, 0).exit_code(), Some(0));
    assert_eq!(getppid(), Ok(ProcessId::new(0)));
}

#[test]
fn orphans_are_reparented_and_reaped_by_the_host() {
    let host = host();
    let _guard = attach(&host, "grandparent");
    let grandchild = Arc::new(std::sync::Mutex::new(None));
    let slot = grandchild.clone();
    let child = fork(move || {
        match fork(|| {
            let orphaned = common::eventually(|| {
                safe_point();
                getppid() == Ok(ProcessId::new(1))
            });
            if orphaned {
                0
            } else {
                1
            }
        }) {
            Ok(pid) => {
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(pid);
                }
                0
            }
            Err(_) => 1,
        }
    })
    .unwrap();
    assert_eq!(wait_status(child, 0).exit_code(), Some(0));

    let orphan = grandchild.lock().unwrap().expect("grandchild forked");
    assert!(common::eventually(|| host.get_process(orphan).is_none()));
}

#[test]
fn child_limit_is_enforced() {
    let host = host_with("max_children=1");
    let _guard = attach(&host, "limited");
    let first = fork(idle).unwrap();
    assert_eq!(fork(|| 0), Err(Errno::EAGAIN));
    kill(arg(first), SIGKILL).unwrap();
    wait_status(first, 0);

    let second = fork(|| 9).unwrap();
    assert_eq!(wait_status(second, 0).exit_code(), Some(9));
}

#[test]
fn exit_from_a_secondary_thread_ends_the_process() {
    let host = host();
    let _guard = attach(&host, "parent");
    let child = fork(|| {
        let worker = pthread_create(|| {
            let _ = exit(5);
        });
        if worker.is_err() {
            return 1;
        }
        idle()
    })
    .unwrap();
    assert_eq!(wait_status(child, 0).exit_code(), Some(5));
}

#[test]
fn panicking_main_thread_aborts_the_process() {
    let host = host_with("nocore");
    let _guard = attach(&host, "parent");
    let child = fork(|| panic!("child blew up")).unwrap();
    assert_eq!(wait_status(child, 0).term_signal(), Some(SIGABRT));
}

#[test]
fn thread_ids_are_distinct_from_the_main_thread() {
    let host = host();
    let guard = attach(&host, "threads");
    assert_eq!(gettid(), Ok(guard.pid().as_u32()));
    let handle = pthread_create(|| {}).unwrap();
    assert_ne!(handle.tid(), guard.pid().as_u32());
    handle.join().unwrap();
}
