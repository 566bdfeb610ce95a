//! Commune: cross-process introspection
//!
//! A requester sends a `Commune` packet carrying a query and a response
//! pipe granted into the target's handle table. The target's dispatcher
//! hands the query to a short-lived worker thread, which streams the answer
//! back and closes the pipe:
//!
//! ```text
//! status  i32    0 or an errno value
//! record  u32 length + bytes, repeated until EOF
//! ```

use std::sync::Arc;
use std::time::Instant;

use super::pipe::{pipe, PipeError, PipeReader, PipeWriter};
use crate::process::{Process, ProcessId, ProcessServices};
use crate::signal::channel::{self, Outgoing};
use crate::signal::packet::{ControlOp, SignalPacket};
use crate::syscall::errno::Errno;
use crate::task::Context;

/// Largest record a requester will accept
const MAX_RECORD: usize = 1 << 20;

/// Question asked of another process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommuneQuery {
    Cwd,
    Root,
    Cmdline,
    Environ,
    Fds,
    FdName(i32),
}

impl CommuneQuery {
    /// Query kind and argument as carried in a packet
    pub fn to_wire(self) -> (u16, i32) {
        match self {
            CommuneQuery::Cwd => (1, 0),
            CommuneQuery::Root => (2, 0),
            CommuneQuery::Cmdline => (3, 0),
            CommuneQuery::Environ => (4, 0),
            CommuneQuery::Fds => (5, 0),
            CommuneQuery::FdName(fd) => (6, fd),
        }
    }

    pub fn from_wire(kind: u16, arg: i32) -> Option<CommuneQuery> {
        match kind {
            1 => Some(CommuneQuery::Cwd),
            2 => Some(CommuneQuery::Root),
            3 => Some(CommuneQuery::Cmdline),
            4 => Some(CommuneQuery::Environ),
            5 => Some(CommuneQuery::Fds),
            6 => Some(CommuneQuery::FdName(arg)),
            _ => None,
        }
    }
}

fn answer(query: CommuneQuery, services: &dyn ProcessServices) -> Result<Vec<String>, Errno> {
    match query {
        CommuneQuery::Cwd => Ok(vec![services.cwd()]),
        CommuneQuery::Root => Ok(vec![services.root()]),
        CommuneQuery::Cmdline => Ok(services.cmdline()),
        CommuneQuery::Environ => Ok(services.environ()),
        CommuneQuery::Fds => Ok(services.open_fds().iter().map(|fd| fd.to_string()).collect()),
        CommuneQuery::FdName(fd) => services.fd_name(fd).map(|name| vec![name]).ok_or(Errno::EINVAL),
    }
}

/// Answer `query` into `writer`; runs on the target's worker thread
pub fn serve(query: CommuneQuery, services: &dyn ProcessServices, writer: PipeWriter) {
    let result = answer(query, services);
    let status = match &result {
        Ok(_) => 0,
        Err(e) => e.as_i32(),
    };
    if let Err(e) = write_reply(&writer, status, result.as_deref().unwrap_or(&[])) {
        log::debug!("commune {:?}: requester went away: {}", query, e);
    }
}

fn write_reply(writer: &PipeWriter, status: i32, records: &[String]) -> Result<(), PipeError> {
    writer.write_all(&status.to_le_bytes())?;
    for record in records {
        let mut buf = Vec::with_capacity(4 + record.len());
        buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
        buf.extend_from_slice(record.as_bytes());
        writer.write_all(&buf)?;
    }
    Ok(())
}

/// Ask process `pid` a question on behalf of the calling thread
pub fn request(ctx: &Context, pid: ProcessId, query: CommuneQuery) -> Result<Vec<String>, Errno> {
    let host = ctx.process.host().ok_or(Errno::ESRCH)?;
    let target = host.get_process(pid).filter(|p| !p.is_exited()).ok_or(Errno::ESRCH)?;

    // Answer locally without a round trip
    if Arc::ptr_eq(&target, &ctx.process) {
        return answer(query, ctx.process.services().as_ref());
    }

    let (reader, writer) = pipe();
    let mut packet = SignalPacket::control(ControlOp::Commune, ctx.process.id.as_u32());
    packet.query = Some(query);
    channel::send(Some(&ctx.process), &target, Outgoing::new(packet).with_response(writer).wait())?;

    let mut reply = Reply {
        reader,
        target: &target,
        deadline: Instant::now() + target.config().commune_timeout,
    };
    let mut status = [0u8; 4];
    if !reply.fill(&mut status)? {
        // Worker never answered; the target died or dropped the request
        return Err(if target.is_exited() { Errno::ESRCH } else { Errno::EPIPE });
    }
    let status = i32::from_le_bytes(status);
    if status != 0 {
        return Err(Errno::from_i32(status).unwrap_or(Errno::EINVAL));
    }

    let mut records = Vec::new();
    let mut len = [0u8; 4];
    while reply.fill(&mut len)? {
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_RECORD {
            log::warn!("commune {:?} from {}: oversized record ({} bytes)", query, pid, len);
            return Err(Errno::EINVAL);
        }
        let mut data = vec![0u8; len];
        if !reply.fill(&mut data)? && len > 0 {
            return Err(Errno::EPIPE);
        }
        records.push(String::from_utf8_lossy(&data).into_owned());
    }
    Ok(records)
}

struct Reply<'a> {
    reader: PipeReader,
    target: &'a Process,
    deadline: Instant,
}

impl Reply<'_> {
    /// Fill `buf` completely. `Ok(false)` means clean EOF before any byte.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool, Errno> {
        let poll = self.target.config().commune_poll;
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read_timeout(&mut buf[filled..], poll) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(Errno::EPIPE),
                Ok(n) => filled += n,
                Err(PipeError::TimedOut) => {
                    if self.target.is_exited() && !self.reader.is_readable() {
                        return Err(Errno::ESRCH);
                    }
                    if Instant::now() >= self.deadline {
                        log::warn!("commune with process {} timed out", self.target.id);
                        return Err(Errno::ETIMEDOUT);
                    }
                }
                Err(_) => return Err(Errno::EPIPE),
            }
        }
        Ok(true)
    }
}
