//! Signal channel
//!
//! Every process owns one pipe; its dispatcher thread holds the read end
//! and the process publishes the write end once it is running. Senders
//! obtain a writer, grant any capabilities the packet refers to into the
//! receiver's handle table, write the 64-byte packet and optionally wait
//! for the dispatcher to acknowledge it.

use core::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::packet::{ControlOp, SignalPacket};
use crate::config::RuntimeConfig;
use crate::ipc::handle::{Capability, MaskSlot};
use crate::ipc::pipe::PipeWriter;
use crate::process::{ChannelState, Process};
use crate::sync::Event;
use crate::syscall::errno::Errno;

/// Slice between liveness checks while waiting for an acknowledgement
const COMPLETION_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Still initializing after every publish retry
    NotPublished,
    /// Process has exited or its dispatcher is gone
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    NoProcess,
    /// Dispatcher did not acknowledge within `send_timeout`
    CompletionTimeout,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NoProcess => f.write_str("no such process"),
            SendError::CompletionTimeout => f.write_str("completion timed out"),
        }
    }
}

impl From<ChannelError> for SendError {
    fn from(_: ChannelError) -> Self {
        SendError::NoProcess
    }
}

impl From<SendError> for Errno {
    fn from(e: SendError) -> Self {
        match e {
            SendError::NoProcess => Errno::ESRCH,
            SendError::CompletionTimeout => Errno::ETIMEDOUT,
        }
    }
}

/// A packet plus the capabilities to grant with it
pub struct Outgoing {
    pub packet: SignalPacket,
    /// Wait for the dispatcher to finish with the packet
    pub wait: bool,
    pub mask: Option<Arc<MaskSlot>>,
    pub response: Option<PipeWriter>,
}

impl Outgoing {
    pub fn new(packet: SignalPacket) -> Self {
        Outgoing {
            packet,
            wait: false,
            mask: None,
            response: None,
        }
    }

    pub fn wait(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn with_mask(mut self, slot: Arc<MaskSlot>) -> Self {
        self.mask = Some(slot);
        self
    }

    pub fn with_response(mut self, writer: PipeWriter) -> Self {
        self.response = Some(writer);
        self
    }
}

/// Obtain a writer for `target`'s channel, retrying while it initializes
pub fn grant_channel(config: &RuntimeConfig, target: &Process) -> Result<PipeWriter, ChannelError> {
    for attempt in 0..=config.publish_retries {
        match target.channel_state() {
            ChannelState::Published(writer) => return Ok(writer),
            ChannelState::Gone => return Err(ChannelError::Closed),
            ChannelState::Initializing => {
                if attempt < config.publish_retries {
                    std::thread::sleep(config.publish_retry_delay);
                }
            }
        }
    }
    log::warn!("process {}: channel never published", target.id);
    Err(ChannelError::NotPublished)
}

/// Send `out` to `target`
///
/// `local` is the sending process, if any. A process talking to itself
/// uses its own published writer directly.
pub fn send(local: Option<&Arc<Process>>, target: &Arc<Process>, out: Outgoing) -> Result<(), SendError> {
    let config = target.config();
    let writer = match local {
        Some(p) if Arc::ptr_eq(p, target) => match target.channel_state() {
            ChannelState::Published(writer) => writer,
            _ => return Err(SendError::NoProcess),
        },
        _ => grant_channel(config, target)?,
    };

    let Outgoing {
        mut packet,
        wait,
        mask,
        response,
    } = out;
    let completion = wait.then(|| Arc::new(Event::new()));

    let granted = {
        let mut handles = target.handles();
        let mut granted = Vec::with_capacity(3);
        if let Some(event) = &completion {
            let id = handles.insert(Capability::Completion(event.clone()));
            packet.completion_ref = Some(id);
            granted.push(id);
        }
        if let Some(slot) = mask {
            let id = handles.insert(Capability::Mask(slot));
            packet.mask_ref = Some(id);
            granted.push(id);
        }
        if let Some(response) = response {
            let id = handles.insert(Capability::Response(response));
            packet.response_ref = Some(id);
            granted.push(id);
        }
        granted
    };

    if let Err(e) = writer.write_all(&packet.encode()) {
        log::debug!("process {}: channel write failed: {}", target.id, e);
        let mut handles = target.handles();
        for id in granted {
            handles.remove(id);
        }
        return Err(SendError::NoProcess);
    }
    drop(writer);

    match completion {
        Some(event) => wait_for_completion(config, target, &event),
        None => Ok(()),
    }
}

fn wait_for_completion(config: &RuntimeConfig, target: &Process, event: &Event) -> Result<(), SendError> {
    let deadline = Instant::now() + config.send_timeout;
    loop {
        if event.wait_timeout(COMPLETION_SLICE) {
            return Ok(());
        }
        // The packet went down with the dispatcher
        if target.dispatcher_done() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            log::warn!(
                "process {}: dispatcher did not acknowledge within {:?}",
                target.id,
                config.send_timeout
            );
            return Err(SendError::CompletionTimeout);
        }
    }
}

/// Send a control operation to `process`'s own dispatcher
pub fn control(process: &Arc<Process>, op: ControlOp, wait: bool) -> Result<(), SendError> {
    let packet = SignalPacket::control(op, process.id.as_u32());
    let out = Outgoing::new(packet);
    send(Some(process), process, if wait { out.wait() } else { out })
}

/// Ask the dispatcher to re-evaluate the pending queue
///
/// A waited flush is acknowledged; an unwaited one travels as `FlushFast`.
pub fn flush(process: &Arc<Process>, wait: bool) -> Result<(), SendError> {
    let op = if wait { ControlOp::Flush } else { ControlOp::FlushFast };
    control(process, op, wait)
}
