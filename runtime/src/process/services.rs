//! Services supplied by the embedding layers
//!
//! The fd table, the tty layer and path translation live outside this
//! crate. The runtime only asks them the few questions it needs.

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::Mutex;

/// Per-process view of the external fd/tty/path layers
pub trait ProcessServices: Send + Sync {
    /// Current working directory, POSIX form
    fn cwd(&self) -> String;

    /// Root directory, POSIX form
    fn root(&self) -> String {
        String::from("/")
    }

    fn cmdline(&self) -> Vec<String>;

    fn environ(&self) -> Vec<String>;

    /// Open descriptors, ascending
    fn open_fds(&self) -> Vec<i32>;

    /// Canonical name of an open descriptor
    fn fd_name(&self, fd: i32) -> Option<String>;

    fn is_close_on_exec(&self, fd: i32) -> bool;

    /// Discard unread terminal input (called on console interrupt)
    fn flush_tty_input(&self) {}

    /// Services for a forked child
    fn duplicate(&self) -> Arc<dyn ProcessServices>;

    /// Services after an exec of `argv`: close-on-exec descriptors are gone
    fn exec(&self, argv: &[String]) -> Arc<dyn ProcessServices>;
}

#[derive(Debug, Clone)]
struct FdEntry {
    name: String,
    cloexec: bool,
}

#[derive(Debug, Clone, Default)]
struct StaticState {
    cwd: String,
    root: String,
    argv: Vec<String>,
    env: Vec<String>,
    fds: BTreeMap<i32, FdEntry>,
    tty_flushes: usize,
}

/// In-memory services for tests and demos
#[derive(Debug, Default)]
pub struct StaticServices {
    state: Mutex<StaticState>,
}

impl StaticServices {
    pub fn new(argv: &[&str]) -> Self {
        StaticServices {
            state: Mutex::new(StaticState {
                cwd: String::from("/"),
                root: String::from("/"),
                argv: argv.iter().map(|s| s.to_string()).collect(),
                env: Vec::new(),
                fds: BTreeMap::new(),
                tty_flushes: 0,
            }),
        }
    }

    pub fn with_std_fds(self, tty: &str) -> Self {
        for fd in 0..3 {
            self.open(fd, tty, false);
        }
        self
    }

    pub fn set_cwd(&self, cwd: &str) {
        self.state.lock().cwd = cwd.to_string();
    }

    pub fn set_env(&self, env: &[&str]) {
        self.state.lock().env = env.iter().map(|s| s.to_string()).collect();
    }

    pub fn open(&self, fd: i32, name: &str, cloexec: bool) {
        self.state.lock().fds.insert(
            fd,
            FdEntry {
                name: name.to_string(),
                cloexec,
            },
        );
    }

    pub fn close(&self, fd: i32) {
        self.state.lock().fds.remove(&fd);
    }

    /// Number of times the tty input was flushed
    pub fn tty_flushes(&self) -> usize {
        self.state.lock().tty_flushes
    }

    fn from_state(state: StaticState) -> Self {
        StaticServices {
            state: Mutex::new(state),
        }
    }
}

impl ProcessServices for StaticServices {
    fn cwd(&self) -> String {
        self.state.lock().cwd.clone()
    }

    fn root(&self) -> String {
        self.state.lock().root.clone()
    }

    fn cmdline(&self) -> Vec<String> {
        self.state.lock().argv.clone()
    }

    fn environ(&self) -> Vec<String> {
        self.state.lock().env.clone()
    }

    fn open_fds(&self) -> Vec<i32> {
        self.state.lock().fds.keys().copied().collect()
    }

    fn fd_name(&self, fd: i32) -> Option<String> {
        self.state.lock().fds.get(&fd).map(|e| e.name.clone())
    }

    fn is_close_on_exec(&self, fd: i32) -> bool {
        self.state.lock().fds.get(&fd).map(|e| e.cloexec).unwrap_or(false)
    }

    fn flush_tty_input(&self) {
        self.state.lock().tty_flushes += 1;
    }

    fn duplicate(&self) -> Arc<dyn ProcessServices> {
        let mut state = self.state.lock().clone();
        state.tty_flushes = 0;
        Arc::new(StaticServices::from_state(state))
    }

    fn exec(&self, argv: &[String]) -> Arc<dyn ProcessServices> {
        let mut state = self.state.lock().clone();
        state.argv = argv.to_vec();
        state.fds.retain(|_, e| !e.cloexec);
        state.tty_flushes = 0;
        Arc::new(StaticServices::from_state(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_drops_close_on_exec_descriptors() {
        let services = StaticServices::new(&["sh"]).with_std_fds("/dev/pty0");
        services.open(5, "/tmp/log", true);
        services.open(6, "/tmp/data", false);
        assert!(services.is_close_on_exec(5));

        let after = services.exec(&["ls".to_string(), "-l".to_string()]);
        assert_eq!(after.open_fds(), vec![0, 1, 2, 6]);
        assert_eq!(after.cmdline(), vec!["ls", "-l"]);
        assert_eq!(services.cmdline(), vec!["sh"]);
    }

    #[test]
    fn duplicate_is_independent() {
        let services = StaticServices::new(&["a"]);
        services.set_cwd("/home");
        let child = services.duplicate();
        services.set_cwd("/tmp");
        assert_eq!(child.cwd(), "/home");
        assert_eq!(services.cwd(), "/tmp");
    }
}
