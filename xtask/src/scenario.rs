//! Built-in end-to-end scenarios
//!
//! Each scenario builds its own host, attaches the calling thread as the
//! root process and drives a few children through the POSIX call surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use clap::ValueEnum;
use runtime::interrupts::{raise_exception, ExceptionCode, FaultRecord};
use runtime::process::{ForkOptions, StaticServices, WaitOptions, WaitStatus};
use runtime::signal::constants::*;
use runtime::signal::{safe_point, SignalAction};
use runtime::syscall;
use runtime::{AttachGuard, Host, ProcessId, RuntimeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Stop, continue and kill a child
    JobControl,
    /// Access violation in a child becomes SIGSEGV with a core bit
    Fault,
    /// Ask a child for its cwd, argv and descriptors
    Commune,
    /// One child signals a sibling that catches it
    CrossKill,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::JobControl,
        Scenario::Fault,
        Scenario::Commune,
        Scenario::CrossKill,
    ];

    pub fn marker(self) -> &'static str {
        match self {
            Scenario::JobControl => "JOB_CONTROL",
            Scenario::Fault => "FAULT",
            Scenario::Commune => "COMMUNE",
            Scenario::CrossKill => "CROSS_KILL",
        }
    }
}

pub fn run_scenario(scenario: Scenario) -> Result<()> {
    match scenario {
        Scenario::JobControl => job_control(),
        Scenario::Fault => fault(),
        Scenario::Commune => commune(),
        Scenario::CrossKill => cross_kill(),
    }
}

/// Run `scenario` and print its marker line; true on success
pub fn run_and_report(scenario: Scenario) -> bool {
    match run_scenario(scenario) {
        Ok(()) => {
            println!("TEST_MARKER:{}:PASS", scenario.marker());
            true
        }
        Err(e) => {
            println!("TEST_MARKER:{}:FAIL", scenario.marker());
            eprintln!("  {:#}", e);
            false
        }
    }
}

fn attach(host: &Arc<Host>, name: &str) -> Result<AttachGuard> {
    Ok(host.attach(name, Arc::new(StaticServices::new(&[name])))?)
}

fn idle() -> i32 {
    loop {
        safe_point();
        thread::sleep(Duration::from_millis(5));
    }
}

fn arg(pid: ProcessId) -> i32 {
    pid.as_u32() as i32
}

fn reap(pid: ProcessId, options: WaitOptions) -> Result<WaitStatus> {
    let (got, status) = syscall::waitpid(arg(pid), options.bits())?
        .context("waitpid returned no status")?;
    ensure!(got == pid, "waited for {} but got {}", pid, got);
    Ok(status)
}

fn job_control() -> Result<()> {
    let host = Host::new(RuntimeConfig::from_env());
    let _shell = attach(&host, "shell")?;
    let job = syscall::fork(idle)?;

    syscall::kill(arg(job), SIGSTOP)?;
    let status = reap(job, WaitOptions::WUNTRACED)?;
    ensure!(status.stop_signal() == Some(SIGSTOP), "expected a stop, got {}", status);
    println!("  job {} stopped", job);

    syscall::kill(arg(job), SIGCONT)?;
    let status = reap(job, WaitOptions::WCONTINUED)?;
    ensure!(status.is_continued(), "expected a continue, got {}", status);
    println!("  job {} continued", job);

    syscall::kill(arg(job), SIGKILL)?;
    let status = reap(job, WaitOptions::empty())?;
    ensure!(status.term_signal() == Some(SIGKILL), "expected SIGKILL, got {}", status);
    println!("  job {} killed", job);
    Ok(())
}

fn fault() -> Result<()> {
    let mut config = RuntimeConfig::from_env();
    config.core_dumps = true;
    let host = Host::new(config);
    let _parent = attach(&host, "parent")?;

    let child = syscall::fork(|| {
        let record = FaultRecord::new(ExceptionCode::AccessViolation { write: true }, 0x10);
        let _ = raise_exception(record);
        0
    })?;
    let status = reap(child, WaitOptions::empty())?;
    ensure!(
        status.term_signal() == Some(SIGSEGV) && status.core_dumped(),
        "expected SIGSEGV with core, got {}",
        status
    );
    println!("  child {}: {}", child, status);
    Ok(())
}

fn commune() -> Result<()> {
    let host = Host::new(RuntimeConfig::from_env());
    let _ps = attach(&host, "ps")?;

    let services = StaticServices::new(&["vi", "notes.txt"]).with_std_fds("/dev/pty0");
    services.set_cwd("/home/user");
    let done = Arc::new(AtomicBool::new(false));
    let finished = done.clone();
    let options = ForkOptions {
        services: Some(Arc::new(services)),
        ..Default::default()
    };
    let child = syscall::fork_with(options, move || {
        while !finished.load(Ordering::SeqCst) {
            safe_point();
            thread::sleep(Duration::from_millis(5));
        }
        0
    })?;

    let cwd = syscall::proc_cwd(child);
    let argv = syscall::proc_cmdline(child);
    let fds = syscall::proc_fds(child);
    done.store(true, Ordering::SeqCst);
    reap(child, WaitOptions::empty())?;

    let (cwd, argv, fds) = (cwd?, argv?, fds?);
    println!("  {}: cwd={} argv={:?} fds={:?}", child, cwd, argv, fds);
    ensure!(cwd == "/home/user", "unexpected cwd {}", cwd);
    ensure!(argv == ["vi", "notes.txt"], "unexpected argv {:?}", argv);
    ensure!(fds == [0, 1, 2], "unexpected descriptors {:?}", fds);
    Ok(())
}

fn cross_kill() -> Result<()> {
    let host = Host::new(RuntimeConfig::from_env());
    let _parent = attach(&host, "parent")?;

    let caught = Arc::new(AtomicBool::new(false));
    {
        let caught = caught.clone();
        syscall::sigaction(
            SIGUSR1,
            Some(SignalAction::handler(move |_| caught.store(true, Ordering::SeqCst))),
        )?;
    }

    let flag = caught.clone();
    let receiver = syscall::fork(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return 1;
            }
            safe_point();
            thread::sleep(Duration::from_millis(5));
        }
        0
    })?;
    let sender = syscall::fork(move || match syscall::kill(arg(receiver), SIGUSR1) {
        Ok(()) => 0,
        Err(e) => e.as_i32(),
    })?;

    let sent = reap(sender, WaitOptions::empty())?;
    ensure!(sent.exit_code() == Some(0), "sender failed: {}", sent);
    let received = reap(receiver, WaitOptions::empty())?;
    ensure!(received.exit_code() == Some(0), "receiver never caught SIGUSR1: {}", received);
    println!("  {} -> {}: SIGUSR1 caught", sender, receiver);
    Ok(())
}
