mod common;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{attach, eventually, host, idle, wait_status};
use posixrt::ipc::HandleId;
use posixrt::prelude::*;
use posixrt::signal::channel::grant_channel;
use posixrt::signal::packet::SignalPacket;

fn counting_handler(hits: &Arc<AtomicUsize>) -> SignalAction {
    let hits = hits.clone();
    SignalAction::handler(move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn blocked_signal_runs_handler_once_after_unblock() {
    let host = host();
    let _guard = attach(&host, "blocker");
    let hits = Arc::new(AtomicUsize::new(0));
    sigaction(SIGUSR1, Some(counting_handler(&hits))).unwrap();

    sigprocmask(SIG_BLOCK, Some(sig_mask(SIGUSR1))).unwrap();
    raise(SIGUSR1).unwrap();
    raise(SIGUSR1).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(sigpending().unwrap(), sig_mask(SIGUSR1));

    let old = sigprocmask(SIG_UNBLOCK, Some(sig_mask(SIGUSR1))).unwrap();
    assert_eq!(old, sig_mask(SIGUSR1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(sigpending().unwrap(), 0);
}

#[test]
fn unmaskable_signals_are_stripped_from_the_mask() {
    let host = host();
    let _guard = attach(&host, "masker");
    sigprocmask(SIG_SETMASK, Some(sig_mask(SIGKILL) | sig_mask(SIGSTOP) | sig_mask(SIGHUP))).unwrap();
    assert_eq!(sigprocmask(SIG_BLOCK, None).unwrap(), sig_mask(SIGHUP));
    assert_eq!(sigprocmask(99, Some(0)), Err(Errno::EINVAL));
}

#[test]
fn kill_zero_probes_without_side_effects() {
    let host = host();
    let _guard = attach(&host, "prober");
    let child = fork(idle).unwrap();

    kill(common::arg(child), 0).unwrap();
    let process = host.get_process(child).unwrap();
    assert_eq!(process.pending_bits(), 0);
    assert!(!process.is_exited());
    assert_eq!(kill(999_999, 0), Err(Errno::ESRCH));

    kill(common::arg(child), SIGKILL).unwrap();
    assert_eq!(wait_status(child, 0).term_signal(), Some(SIGKILL));
    assert_eq!(kill(common::arg(child), 0), Err(Errno::ESRCH));
}

#[test]
fn cross_process_handler_runs_and_pending_clears() {
    let host = host();
    let _guard = attach(&host, "sender");
    let seen = Arc::new(AtomicBool::new(false));
    let from = Arc::new(AtomicI32::new(0));
    {
        let seen = seen.clone();
        let from = from.clone();
        sigaction(
            SIGUSR1,
            Some(SignalAction::handler(move |info| {
                from.store(info.pid as i32, Ordering::SeqCst);
                seen.store(true, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }

    let flag = seen.clone();
    let child = fork(move || {
        let ok = eventually(|| {
            safe_point();
            flag.load(Ordering::SeqCst)
        });
        if ok && sigpending() == Ok(0) {
            0
        } else {
            1
        }
    })
    .unwrap();

    kill(common::arg(child), SIGUSR1).unwrap();
    assert_eq!(wait_status(child, 0).exit_code(), Some(0));
    assert_eq!(from.load(Ordering::SeqCst), common::arg(getpid().unwrap()));
}

#[test]
fn uncatchable_signals_refuse_changes() {
    let host = host();
    let _guard = attach(&host, "stubborn");
    assert_eq!(sigaction(SIGKILL, Some(SignalAction::ignore())).err(), Some(Errno::EINVAL));
    assert_eq!(sigaction(SIGSTOP, Some(SignalAction::ignore())).err(), Some(Errno::EINVAL));
    assert!(sigaction(SIGKILL, None).unwrap().is_default());
    assert_eq!(sigaction(0, None).err(), Some(Errno::EINVAL));
    assert_eq!(kill(1, NSIG + 1), Err(Errno::EINVAL));
}

#[test]
fn ignoring_a_signal_discards_its_pending_instance() {
    let host = host();
    let _guard = attach(&host, "ignorer");
    sigprocmask(SIG_BLOCK, Some(sig_mask(SIGUSR2))).unwrap();
    raise(SIGUSR2).unwrap();
    assert_eq!(sigpending().unwrap(), sig_mask(SIGUSR2));

    sigaction(SIGUSR2, Some(SignalAction::ignore())).unwrap();
    assert_eq!(sigpending().unwrap(), 0);
}

#[test]
fn resethand_restores_default_after_one_delivery() {
    let host = host();
    let _guard = attach(&host, "oneshot");
    let hits = Arc::new(AtomicUsize::new(0));
    sigaction(SIGUSR1, Some(counting_handler(&hits).with_flags(SaFlags::RESETHAND))).unwrap();
    raise(SIGUSR1).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(sigaction(SIGUSR1, None).unwrap().is_default());
}

#[test]
fn sigsuspend_runs_handler_and_restores_mask() {
    let host = host();
    let guard = attach(&host, "suspender");
    let hits = Arc::new(AtomicUsize::new(0));
    sigaction(SIGUSR1, Some(counting_handler(&hits))).unwrap();
    sigprocmask(SIG_BLOCK, Some(sig_mask(SIGUSR1))).unwrap();

    let main = guard.thread().tid;
    let helper = pthread_create(move || {
        thread::sleep(Duration::from_millis(20));
        pthread_kill(main, SIGUSR1).unwrap();
    })
    .unwrap();

    assert_eq!(sigsuspend(0), Errno::EINTR);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(sigprocmask(SIG_BLOCK, None).unwrap(), sig_mask(SIGUSR1));
    helper.join().unwrap();
}

#[test]
fn sigwait_accepts_pending_and_directed_signals() {
    let host = host();
    let guard = attach(&host, "waiter");
    let set = sig_mask(SIGUSR1) | sig_mask(SIGUSR2);
    sigprocmask(SIG_BLOCK, Some(set)).unwrap();

    raise(SIGUSR1).unwrap();
    assert_eq!(sigwait(set), Ok(SIGUSR1));
    assert_eq!(sigpending().unwrap(), 0);

    let pid = common::arg(guard.pid());
    let helper = pthread_create(move || {
        thread::sleep(Duration::from_millis(20));
        sigqueue(pid, SIGUSR2, 77).unwrap();
    })
    .unwrap();
    let info = sigwaitinfo(set).unwrap();
    assert_eq!((info.sig(), info.code, info.value), (SIGUSR2, SI_QUEUE, 77));
    helper.join().unwrap();
}

#[test]
fn sigtimedwait_gives_up_with_eagain() {
    let host = host();
    let _guard = attach(&host, "impatient");
    sigprocmask(SIG_BLOCK, Some(sig_mask(SIGUSR1))).unwrap();
    let result = sigtimedwait(sig_mask(SIGUSR1), Duration::from_millis(50));
    assert_eq!(result.err(), Some(Errno::EAGAIN));
    assert_eq!(sigwait(sig_mask(SIGKILL)), Err(Errno::EINVAL));
}

#[test]
fn default_terminating_signal_ends_a_child() {
    let host = host();
    let _guard = attach(&host, "parent");
    let child = fork(idle).unwrap();
    kill(common::arg(child), SIGTERM).unwrap();
    let status = wait_status(child, 0);
    assert_eq!(status.term_signal(), Some(SIGTERM));
    assert!(!status.core_dumped());
}

#[test]
fn one_shot_handler_survives_a_busy_thread() {
    let host = host();
    let _guard = attach(&host, "parent");
    let ready = Arc::new(AtomicBool::new(false));
    let installed = ready.clone();
    let child = fork(move || {
        let hits = Arc::new(AtomicUsize::new(0));
        if sigaction(SIGUSR2, Some(SignalAction::handler(|_| {}))).is_err()
            || sigaction(SIGUSR1, Some(counting_handler(&hits).with_flags(SaFlags::RESETHAND))).is_err()
        {
            return 2;
        }
        installed.store(true, Ordering::SeqCst);
        // SIGUSR2 is armed here and SIGUSR1 has to queue behind it
        thread::sleep(Duration::from_millis(400));
        let ran = eventually(|| {
            safe_point();
            hits.load(Ordering::SeqCst) == 1
        });
        if ran && sigaction(SIGUSR1, None).is_ok_and(|a| a.is_default()) {
            0
        } else {
            1
        }
    })
    .unwrap();

    assert!(eventually(|| ready.load(Ordering::SeqCst)));
    kill(common::arg(child), SIGUSR2).unwrap();
    kill(common::arg(child), SIGUSR1).unwrap();
    assert_eq!(wait_status(child, 0).exit_code(), Some(0));
}

#[test]
fn signal_armed_on_a_returning_thread_is_not_lost() {
    let host = host();
    let guard = attach(&host, "threads");
    let hits = Arc::new(AtomicUsize::new(0));
    sigaction(SIGUSR1, Some(counting_handler(&hits))).unwrap();
    sigprocmask(SIG_BLOCK, Some(sig_mask(SIGUSR1))).unwrap();

    let ready = Arc::new(AtomicBool::new(false));
    let unblocked = ready.clone();
    let worker = pthread_create(move || {
        if sigprocmask(SIG_UNBLOCK, Some(sig_mask(SIGUSR1))).is_ok() {
            unblocked.store(true, Ordering::SeqCst);
        }
        // Returns without passing another safe point
        thread::sleep(Duration::from_millis(300));
    })
    .unwrap();
    assert!(eventually(|| ready.load(Ordering::SeqCst)));

    kill(common::arg(guard.pid()), SIGUSR1).unwrap();
    worker.join().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(sigpending().unwrap(), sig_mask(SIGUSR1));

    sigprocmask(SIG_UNBLOCK, Some(sig_mask(SIGUSR1))).unwrap();
    assert!(eventually(|| {
        safe_point();
        hits.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(sigpending().unwrap(), 0);
}

#[test]
fn signal_arriving_inside_a_runtime_section_runs_after_it() {
    let host = host();
    let _guard = attach(&host, "section");
    let hits = Arc::new(AtomicUsize::new(0));
    sigaction(SIGUSR1, Some(counting_handler(&hits))).unwrap();

    let ctx = posixrt::task::current().unwrap();
    {
        let _section = ctx.enter_runtime();
        raise(SIGUSR1).unwrap();
        safe_point();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!ctx.thread.has_armed());
    }
    assert!(eventually(|| {
        safe_point();
        hits.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn malformed_packet_kills_only_the_receiver() {
    let host = host();
    let guard = attach(&host, "sender");
    let child = fork(idle).unwrap();
    let target = host.get_process(child).unwrap();

    let writer = grant_channel(target.config(), &target).unwrap();
    let mut packet = SignalPacket::signal(SigInfo::user(SIGUSR1, guard.pid().as_u32()), guard.pid().as_u32());
    packet.completion_ref = HandleId::from_wire(999);
    writer.write_all(&packet.encode()).unwrap();
    drop(writer);

    assert_eq!(wait_status(child, 0).term_signal(), Some(SIGABRT));
    assert!(!guard.process().is_exited());
    assert_eq!(getpid(), Ok(guard.pid()));
}
