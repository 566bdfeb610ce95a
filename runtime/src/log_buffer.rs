//! Recent-log ring buffer
//!
//! Every formatted log line is captured here so that a fatal fault dump can
//! include what the runtime was doing just before the crash. The oldest
//! line is dropped when the ring is full.

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;

/// Number of lines kept by the global ring
pub const LOG_RING_LINES: usize = 256;

static RING: OnceCell<LogRing> = OnceCell::uninit();

/// Bounded line ring
pub struct LogRing {
    lines: ArrayQueue<String>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        LogRing {
            lines: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn push(&self, line: String) {
        self.lines.force_push(line);
    }

    /// Snapshot of the captured lines, oldest first.
    ///
    /// Lines pushed concurrently with the snapshot may be reordered or lost.
    pub fn snapshot(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.lines.len());
        while let Some(line) = self.lines.pop() {
            lines.push(line);
        }
        for line in &lines {
            self.lines.force_push(line.clone());
        }
        lines
    }

    /// Last `n` lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<String> {
        let mut lines = self.snapshot();
        let skip = lines.len().saturating_sub(n);
        lines.drain(..skip);
        lines
    }
}

fn ring() -> &'static LogRing {
    RING.get_or_init(|| LogRing::new(LOG_RING_LINES))
}

/// Capture a single line into the global ring
pub fn capture(line: String) {
    ring().push(line);
}

/// Last `n` lines of the global ring
pub fn tail(n: usize) -> Vec<String> {
    ring().tail(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_lines_are_dropped() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(format!("line {}", i));
        }
        assert_eq!(ring.snapshot(), vec!["line 2", "line 3", "line 4"]);
        // snapshot is non-destructive
        assert_eq!(ring.snapshot().len(), 3);
    }

    #[test]
    fn tail_returns_newest_lines() {
        let ring = LogRing::new(8);
        for i in 0..6 {
            ring.push(format!("{}", i));
        }
        assert_eq!(ring.tail(2), vec!["4", "5"]);
        assert_eq!(ring.tail(100).len(), 6);
    }
}
