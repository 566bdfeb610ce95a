//! Pipe buffer implementation
//!
//! Pipes provide unidirectional byte streams between emulated processes.
//! Signal channels, child state channels and commune responses are all
//! built on them. The read and write ends are separate handles; dropping
//! the last writer yields EOF, dropping the reader breaks the pipe.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use core::fmt;

/// Default pipe buffer size (matches Linux)
pub const PIPE_BUF_SIZE: usize = 65536;

/// Writes up to this size are atomic with respect to other writers
pub const PIPE_BUF: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// No readers remain
    Broken,
    /// No writers remain and the buffer is drained
    Eof,
    TimedOut,
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::Broken => f.write_str("broken pipe"),
            PipeError::Eof => f.write_str("end of stream"),
            PipeError::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Pipe buffer - a circular buffer with reader/writer tracking
struct PipeBuffer {
    /// The buffer storage
    buffer: Vec<u8>,
    /// Read position in the circular buffer
    read_pos: usize,
    /// Write position in the circular buffer
    write_pos: usize,
    /// Number of bytes currently in the buffer
    len: usize,
    /// Number of active readers (0 = broken pipe on write)
    readers: usize,
    /// Number of active writers (0 = EOF on read)
    writers: usize,
}

impl PipeBuffer {
    fn new(capacity: usize) -> Self {
        PipeBuffer {
            buffer: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
            len: 0,
            readers: 1,
            writers: 1,
        }
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn available(&self) -> usize {
        self.capacity() - self.len
    }

    /// Copy out up to `buf.len()` bytes; caller guarantees `len > 0`
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let to_read = buf.len().min(self.len);
        let cap = self.capacity();
        for slot in buf.iter_mut().take(to_read) {
            *slot = self.buffer[self.read_pos];
            self.read_pos = (self.read_pos + 1) % cap;
        }
        self.len -= to_read;
        to_read
    }

    /// Copy in as much of `buf` as fits
    fn write(&mut self, buf: &[u8]) -> usize {
        let to_write = buf.len().min(self.available());
        let cap = self.capacity();
        for &byte in buf.iter().take(to_write) {
            self.buffer[self.write_pos] = byte;
            self.write_pos = (self.write_pos + 1) % cap;
        }
        self.len += to_write;
        to_write
    }
}

struct Pipe {
    buffer: Mutex<PipeBuffer>,
    readable: Condvar,
    writable: Condvar,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a pipe with the default buffer size
pub fn pipe() -> (PipeReader, PipeWriter) {
    pipe_with_capacity(PIPE_BUF_SIZE)
}

pub fn pipe_with_capacity(capacity: usize) -> (PipeReader, PipeWriter) {
    let pipe = Arc::new(Pipe {
        buffer: Mutex::new(PipeBuffer::new(capacity.max(PIPE_BUF))),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });
    (PipeReader { pipe: pipe.clone() }, PipeWriter { pipe })
}

/// Read end of a pipe. There is exactly one per pipe.
pub struct PipeReader {
    pipe: Arc<Pipe>,
}

impl PipeReader {
    /// Block until some data is available. `Ok(0)` means EOF.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        self.read_deadline(buf, None)
    }

    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, PipeError> {
        self.read_deadline(buf, Some(Instant::now() + timeout))
    }

    fn read_deadline(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, PipeError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.pipe.lock();
        loop {
            if inner.len > 0 {
                let n = inner.read(buf);
                drop(inner);
                self.pipe.writable.notify_all();
                return Ok(n);
            }
            if inner.writers == 0 {
                return Ok(0);
            }
            inner = match deadline {
                None => self
                    .pipe
                    .readable
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PipeError::TimedOut);
                    }
                    self.pipe
                        .readable
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Fill `buf` completely. EOF before the first byte is `Eof`; EOF in the
    /// middle of a record is also `Eof` since a partial record is useless.
    pub fn read_exact(&self, buf: &mut [u8]) -> Result<(), PipeError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(PipeError::Eof),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Check if pipe is readable (has data or EOF)
    pub fn is_readable(&self) -> bool {
        let inner = self.pipe.lock();
        inner.len > 0 || inner.writers == 0
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut inner = self.pipe.lock();
        inner.readers = inner.readers.saturating_sub(1);
        drop(inner);
        self.pipe.writable.notify_all();
    }
}

/// Write end of a pipe. Cloning adds a writer.
pub struct PipeWriter {
    pipe: Arc<Pipe>,
}

impl PipeWriter {
    /// Write the whole buffer, blocking while the pipe is full.
    ///
    /// Writes of at most `PIPE_BUF` bytes are never interleaved with other
    /// writers: they wait until the whole record fits.
    pub fn write_all(&self, buf: &[u8]) -> Result<(), PipeError> {
        let atomic = buf.len() <= PIPE_BUF;
        let mut written = 0;
        let mut inner = self.pipe.lock();
        while written < buf.len() {
            if inner.readers == 0 {
                return Err(PipeError::Broken);
            }
            let needed = if atomic { buf.len() } else { 1 };
            if inner.available() >= needed {
                written += inner.write(&buf[written..]);
                self.pipe.readable.notify_all();
                continue;
            }
            inner = self
                .pipe
                .writable
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    /// Check if pipe is writable (has space and readers exist)
    pub fn is_writable(&self) -> bool {
        let inner = self.pipe.lock();
        inner.len < inner.capacity() && inner.readers > 0
    }

    /// True once the read end is gone
    pub fn is_broken(&self) -> bool {
        self.pipe.lock().readers == 0
    }
}

impl Clone for PipeWriter {
    fn clone(&self) -> Self {
        self.pipe.lock().writers += 1;
        PipeWriter {
            pipe: self.pipe.clone(),
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut inner = self.pipe.lock();
        inner.writers = inner.writers.saturating_sub(1);
        drop(inner);
        self.pipe.readable.notify_all();
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PipeWriter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn data_flows_in_order() {
        let (reader, writer) = pipe();
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let mut buf = [0u8; 11];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn dropping_reader_breaks_pipe() {
        let (reader, writer) = pipe();
        drop(reader);
        assert!(writer.is_broken());
        assert_eq!(writer.write_all(b"x"), Err(PipeError::Broken));
    }

    #[test]
    fn last_writer_gone_is_eof() {
        let (reader, writer) = pipe();
        let second = writer.clone();
        writer.write_all(b"ab").unwrap();
        drop(writer);
        assert!(reader.is_readable());
        drop(second);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Ok(2));
        assert_eq!(reader.read(&mut buf), Ok(0));
        assert_eq!(reader.read_exact(&mut buf), Err(PipeError::Eof));
    }

    #[test]
    fn read_timeout_expires_on_empty_pipe() {
        let (reader, _writer) = pipe();
        let mut buf = [0u8; 1];
        assert_eq!(
            reader.read_timeout(&mut buf, Duration::from_millis(10)),
            Err(PipeError::TimedOut)
        );
    }

    #[test]
    fn writer_blocks_until_reader_drains() {
        let (reader, writer) = pipe_with_capacity(PIPE_BUF);
        let payload = vec![7u8; PIPE_BUF * 3];
        let expected = payload.len();
        let handle = thread::spawn(move || writer.write_all(&payload));
        let mut total = 0;
        let mut buf = [0u8; 1000];
        loop {
            match reader.read(&mut buf).unwrap() {
                0 => break,
                n => total += n,
            }
        }
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(total, expected);
    }

    #[test]
    fn small_records_are_not_interleaved() {
        let (reader, writer) = pipe_with_capacity(PIPE_BUF);
        let mut workers = Vec::new();
        for tag in 0..4u8 {
            let w = writer.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..50 {
                    w.write_all(&[tag; 64]).unwrap();
                }
            }));
        }
        drop(writer);
        let mut record = [0u8; 64];
        let mut count = 0;
        while reader.read_exact(&mut record).is_ok() {
            assert!(record.iter().all(|&b| b == record[0]));
            count += 1;
        }
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(count, 200);
    }
}
