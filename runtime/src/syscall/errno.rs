//! POSIX errno values
//!
//! Error codes returned by the runtime call surface. Every public call
//! returns `Result<T, Errno>`; channel-level failures are translated into
//! one of these before they reach a caller.

use core::fmt;

/// Error numbers surfaced to POSIX callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Operation not permitted
    EPERM,
    /// No such process
    ESRCH,
    /// Interrupted system call
    EINTR,
    /// No child processes
    ECHILD,
    /// Resource temporarily unavailable
    EAGAIN,
    /// Invalid argument
    EINVAL,
    /// Not the caller's controlling terminal
    ENOTTY,
    /// Broken pipe
    EPIPE,
    /// Connection timed out
    ETIMEDOUT,
}

impl Errno {
    /// Numeric value (Linux x86_64 numbering)
    pub const fn as_i32(self) -> i32 {
        match self {
            Errno::EPERM => 1,
            Errno::ESRCH => 3,
            Errno::EINTR => 4,
            Errno::ECHILD => 10,
            Errno::EAGAIN => 11,
            Errno::EINVAL => 22,
            Errno::ENOTTY => 25,
            Errno::EPIPE => 32,
            Errno::ETIMEDOUT => 110,
        }
    }

    /// Reverse of [`Errno::as_i32`]
    pub const fn from_i32(value: i32) -> Option<Errno> {
        match value {
            1 => Some(Errno::EPERM),
            3 => Some(Errno::ESRCH),
            4 => Some(Errno::EINTR),
            10 => Some(Errno::ECHILD),
            11 => Some(Errno::EAGAIN),
            22 => Some(Errno::EINVAL),
            25 => Some(Errno::ENOTTY),
            32 => Some(Errno::EPIPE),
            110 => Some(Errno::ETIMEDOUT),
            _ => None,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "operation not permitted",
            Errno::ESRCH => "no such process",
            Errno::EINTR => "interrupted system call",
            Errno::ECHILD => "no child processes",
            Errno::EAGAIN => "resource temporarily unavailable",
            Errno::EINVAL => "invalid argument",
            Errno::ENOTTY => "inappropriate ioctl for device",
            Errno::EPIPE => "broken pipe",
            Errno::ETIMEDOUT => "timed out",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}): {}", self, self.as_i32(), self.description())
    }
}

impl std::error::Error for Errno {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_match_linux() {
        assert_eq!(Errno::ESRCH.as_i32(), 3);
        assert_eq!(Errno::EINTR.as_i32(), 4);
        assert_eq!(Errno::ECHILD.as_i32(), 10);
        assert_eq!(Errno::EAGAIN.as_i32(), 11);
        assert_eq!(Errno::EINVAL.as_i32(), 22);
    }

    #[test]
    fn from_i32_inverts_as_i32() {
        for e in [Errno::EPERM, Errno::ESRCH, Errno::ECHILD, Errno::ETIMEDOUT] {
            assert_eq!(Errno::from_i32(e.as_i32()), Some(e));
        }
        assert_eq!(Errno::from_i32(9999), None);
    }

    #[test]
    fn display_names_the_error() {
        let text = Errno::ECHILD.to_string();
        assert!(text.starts_with("ECHILD (10)"));
    }
}
