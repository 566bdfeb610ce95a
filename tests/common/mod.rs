//! Helpers shared by the scenario tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use posixrt::prelude::*;

pub fn host() -> Arc<Host> {
    Host::new(RuntimeConfig::default())
}

pub fn host_with(options: &str) -> Arc<Host> {
    Host::new(RuntimeConfig::default().apply(options))
}

/// Register the test thread as process `name`
pub fn attach(host: &Arc<Host>, name: &str) -> AttachGuard {
    host.attach(name, Arc::new(StaticServices::new(&[name])))
        .expect("attach test thread")
}

/// Child body that idles at safe points until it is killed
pub fn idle() -> i32 {
    loop {
        safe_point();
        thread::sleep(Duration::from_millis(5));
    }
}

/// Poll `cond` for up to five seconds
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn arg(pid: ProcessId) -> i32 {
    pid.as_u32() as i32
}

/// Block until `pid` changes state as `options` allows
pub fn wait_status(pid: ProcessId, options: u32) -> WaitStatus {
    let (got, status) = waitpid(arg(pid), options)
        .expect("waitpid")
        .expect("blocking waitpid returned nothing");
    assert_eq!(got, pid);
    status
}
