//! Runtime configuration
//!
//! Defaults can be overridden through the `POSIXRT` environment variable, a
//! space-separated list of `key=value` pairs and bare flags:
//!
//! ```text
//! POSIXRT="core error_start=/usr/bin/gdb arm_retries=50 send_timeout_ms=2000"
//! ```

use std::time::Duration;

/// Environment variable consulted by [`RuntimeConfig::from_env`]
pub const CONFIG_ENV: &str = "POSIXRT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Bound on waiting for a dispatcher to acknowledge a packet
    pub send_timeout: Duration,
    /// Attempts to obtain the channel of a still-initializing process
    pub publish_retries: u32,
    pub publish_retry_delay: Duration,
    /// Attempts to arm a thread that is inside runtime code
    pub arm_retries: u32,
    pub arm_yield: Duration,
    /// Commune read slice between liveness checks
    pub commune_poll: Duration,
    pub commune_timeout: Duration,
    /// Live plus unreaped children per process
    pub max_children: usize,
    /// Set the core bit in the status of core-dumping signals
    pub core_dumps: bool,
    /// Log a register/backtrace dump on fatal faults
    pub dump_on_fault: bool,
    /// Debugger command run on a fatal fault; receives the pid
    pub error_start: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            send_timeout: Duration::from_secs(5),
            publish_retries: 20,
            publish_retry_delay: Duration::from_millis(5),
            arm_retries: 100,
            arm_yield: Duration::from_micros(100),
            commune_poll: Duration::from_millis(50),
            commune_timeout: Duration::from_secs(5),
            max_children: 256,
            core_dumps: false,
            dump_on_fault: true,
            error_start: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `$POSIXRT`
    pub fn from_env() -> Self {
        match std::env::var(CONFIG_ENV) {
            Ok(value) => Self::default().apply(&value),
            Err(_) => Self::default(),
        }
    }

    /// Apply a `POSIXRT`-style option string on top of `self`
    pub fn apply(mut self, options: &str) -> Self {
        for token in options.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            if !self.apply_one(key, value) {
                log::warn!("{}: ignoring unknown option '{}'", CONFIG_ENV, token);
            }
        }
        self
    }

    fn apply_one(&mut self, key: &str, value: Option<&str>) -> bool {
        let millis = |v: Option<&str>| v.and_then(|v| v.parse::<u64>().ok()).map(Duration::from_millis);
        let micros = |v: Option<&str>| v.and_then(|v| v.parse::<u64>().ok()).map(Duration::from_micros);
        let number = |v: Option<&str>| v.and_then(|v| v.parse::<u32>().ok());

        match (key, value) {
            ("core", None) => self.core_dumps = true,
            ("nocore", None) => self.core_dumps = false,
            ("dump", None) => self.dump_on_fault = true,
            ("nodump", None) => self.dump_on_fault = false,
            ("error_start", Some(cmd)) if !cmd.is_empty() => self.error_start = Some(cmd.to_string()),
            ("send_timeout_ms", v) => match millis(v) {
                Some(d) => self.send_timeout = d,
                None => return false,
            },
            ("publish_retries", v) => match number(v) {
                Some(n) => self.publish_retries = n,
                None => return false,
            },
            ("publish_retry_ms", v) => match millis(v) {
                Some(d) => self.publish_retry_delay = d,
                None => return false,
            },
            ("arm_retries", v) => match number(v) {
                Some(n) => self.arm_retries = n,
                None => return false,
            },
            ("arm_yield_us", v) => match micros(v) {
                Some(d) => self.arm_yield = d,
                None => return false,
            },
            ("commune_poll_ms", v) => match millis(v) {
                Some(d) => self.commune_poll = d,
                None => return false,
            },
            ("commune_timeout_ms", v) => match millis(v) {
                Some(d) => self.commune_timeout = d,
                None => return false,
            },
            ("max_children", v) => match number(v) {
                Some(n) => self.max_children = n as usize,
                None => return false,
            },
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_values_override_defaults() {
        let config = RuntimeConfig::default()
            .apply("core error_start=/usr/bin/gdb arm_retries=7 send_timeout_ms=250 nodump");
        assert!(config.core_dumps);
        assert!(!config.dump_on_fault);
        assert_eq!(config.error_start.as_deref(), Some("/usr/bin/gdb"));
        assert_eq!(config.arm_retries, 7);
        assert_eq!(config.send_timeout, Duration::from_millis(250));
    }

    #[test]
    fn unknown_and_malformed_options_are_ignored() {
        let config = RuntimeConfig::default().apply("bogus max_children=lots arm_yield_us=5");
        assert_eq!(config.max_children, RuntimeConfig::default().max_children);
        assert_eq!(config.arm_yield, Duration::from_micros(5));
    }

    #[test]
    fn later_options_win() {
        let config = RuntimeConfig::default().apply("core nocore");
        assert!(!config.core_dumps);
    }
}
