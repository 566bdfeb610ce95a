mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{arg, attach, eventually, host, host_with, idle, wait_status};
use posixrt::prelude::*;

#[test]
fn queries_are_answered_by_the_target() {
    let host = host();
    let _guard = attach(&host, "ps");

    let services = StaticServices::new(&["editor", "notes.txt"]).with_std_fds("/dev/pty3");
    services.set_cwd("/home/user");
    services.set_env(&["HOME=/home/user", "TERM=xterm"]);
    services.open(7, "/home/user/notes.txt", false);

    let done = Arc::new(AtomicBool::new(false));
    let finished = done.clone();
    let options = ForkOptions {
        name: Some(String::from("editor")),
        services: Some(Arc::new(services)),
        ..Default::default()
    };
    let child = fork_with(options, move || {
        if eventually(|| {
            safe_point();
            finished.load(Ordering::SeqCst)
        }) {
            0
        } else {
            1
        }
    })
    .unwrap();

    assert_eq!(proc_cwd(child), Ok(String::from("/home/user")));
    assert_eq!(proc_root(child), Ok(String::from("/")));
    assert_eq!(proc_cmdline(child).unwrap(), vec!["editor", "notes.txt"]);
    assert_eq!(proc_environ(child).unwrap(), vec!["HOME=/home/user", "TERM=xterm"]);
    assert_eq!(proc_fds(child), Ok(vec![0, 1, 2, 7]));
    assert_eq!(proc_fd_name(child, 7), Ok(String::from("/home/user/notes.txt")));
    assert_eq!(proc_fd_name(child, 8), Err(Errno::EINVAL));

    done.store(true, Ordering::SeqCst);
    assert_eq!(wait_status(child, 0).exit_code(), Some(0));
}

#[test]
fn own_process_is_answered_locally() {
    let host = host();
    let guard = attach(&host, "self");
    assert_eq!(proc_cmdline(guard.pid()).unwrap(), vec!["self"]);
    assert_eq!(proc_fds(guard.pid()), Ok(Vec::new()));
}

#[test]
fn exited_or_unknown_targets_are_esrch() {
    let host = host();
    let _guard = attach(&host, "ps");
    let child = fork(|| 0).unwrap();
    assert_eq!(wait_status(child, 0).exit_code(), Some(0));
    assert_eq!(proc_cwd(child), Err(Errno::ESRCH));
    assert_eq!(proc_cmdline(ProcessId::new(arg(child) as u32 + 1000)), Err(Errno::ESRCH));
}

/// Services whose command line only comes back once released
struct StalledServices {
    release: Arc<AtomicBool>,
}

impl ProcessServices for StalledServices {
    fn cwd(&self) -> String {
        String::from("/")
    }

    fn cmdline(&self) -> Vec<String> {
        while !self.release.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        vec![String::from("stalled")]
    }

    fn environ(&self) -> Vec<String> {
        Vec::new()
    }

    fn open_fds(&self) -> Vec<i32> {
        Vec::new()
    }

    fn fd_name(&self, _fd: i32) -> Option<String> {
        None
    }

    fn is_close_on_exec(&self, _fd: i32) -> bool {
        false
    }

    fn duplicate(&self) -> Arc<dyn ProcessServices> {
        Arc::new(StalledServices {
            release: self.release.clone(),
        })
    }

    fn exec(&self, _argv: &[String]) -> Arc<dyn ProcessServices> {
        self.duplicate()
    }
}

fn stalled_child(release: &Arc<AtomicBool>) -> ProcessId {
    let options = ForkOptions {
        services: Some(Arc::new(StalledServices {
            release: release.clone(),
        })),
        ..Default::default()
    };
    fork_with(options, idle).unwrap()
}

#[test]
fn target_killed_mid_query_is_esrch() {
    let host = host();
    let _guard = attach(&host, "ps");
    let release = Arc::new(AtomicBool::new(false));
    let child = stalled_child(&release);

    let killer = pthread_create(move || {
        thread::sleep(Duration::from_millis(100));
        let _ = kill(arg(child), SIGKILL);
    })
    .unwrap();
    assert_eq!(proc_cmdline(child), Err(Errno::ESRCH));
    killer.join().unwrap();

    release.store(true, Ordering::SeqCst);
    assert_eq!(wait_status(child, 0).term_signal(), Some(SIGKILL));
}

#[test]
fn unanswered_query_times_out() {
    let host = host_with("commune_timeout_ms=200");
    let _guard = attach(&host, "ps");
    let release = Arc::new(AtomicBool::new(false));
    let child = stalled_child(&release);

    assert_eq!(proc_cmdline(child), Err(Errno::ETIMEDOUT));

    release.store(true, Ordering::SeqCst);
    kill(arg(child), SIGKILL).unwrap();
    assert_eq!(wait_status(child, 0).term_signal(), Some(SIGKILL));
}
