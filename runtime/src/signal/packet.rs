//! Signal packet wire format
//!
//! A packet is a fixed 64-byte little-endian record. It carries no live
//! pointers: every reference in it is an index into the *receiver's* handle
//! table, inserted by the sender as part of the send.
//!
//! ```text
//!  0  signo        i32   negative values are control operations
//!  4  code         i32
//!  8  errno        i32
//! 12  pid          u32
//! 16  uid          u32
//! 20  sender_pid   u32
//! 24  value        u64
//! 32  addr         u64
//! 40  target_tid   u32   0 = any thread
//! 44  mask_ref     u32   0 = none
//! 48  completion   u32   0 = none
//! 52  query_kind   u16   commune only
//! 54  reserved     u16
//! 56  query_arg    i32
//! 60  response_ref u32
//! ```

use core::fmt;

use super::constants::NSIG;
use super::types::SigInfo;
use crate::ipc::commune::CommuneQuery;
use crate::ipc::handle::HandleId;
use crate::task::ThreadId;

/// Size of an encoded packet
pub const PACKET_SIZE: usize = 64;

/// Dispatcher control operations, encoded below `-NSIG`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// Re-evaluate the pending queue
    Flush,
    /// Like `Flush` but never acknowledged
    FlushFast,
    /// Introspection request
    Commune,
    /// Report the pending set into `mask_ref`
    Pending,
    /// Hold all delivery
    Hold,
    /// Release a previous `Hold`
    NoHold,
    /// A thread went away; release signals directed at it
    ThreadExit,
    /// Stop the dispatcher
    Exit,
}

impl ControlOp {
    const ALL: [ControlOp; 8] = [
        ControlOp::Flush,
        ControlOp::FlushFast,
        ControlOp::Commune,
        ControlOp::Pending,
        ControlOp::Hold,
        ControlOp::NoHold,
        ControlOp::ThreadExit,
        ControlOp::Exit,
    ];

    /// The negative "signal number" this operation travels as
    pub const fn signo(self) -> i32 {
        let base = -(NSIG as i32) - 1;
        match self {
            ControlOp::Flush => base,
            ControlOp::FlushFast => base - 1,
            ControlOp::Commune => base - 2,
            ControlOp::Pending => base - 3,
            ControlOp::Hold => base - 4,
            ControlOp::NoHold => base - 5,
            ControlOp::ThreadExit => base - 6,
            ControlOp::Exit => base - 7,
        }
    }

    pub fn from_signo(signo: i32) -> Option<ControlOp> {
        Self::ALL.iter().copied().find(|op| op.signo() == signo)
    }
}

/// What a decoded packet asks the dispatcher to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Signal(u32),
    Control(ControlOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Signal number is neither a signal nor a control operation
    BadSignal(i32),
    /// Commune packet with an unknown query kind
    BadQuery(u16),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::BadSignal(signo) => write!(f, "bad signal number {}", signo),
            PacketError::BadQuery(kind) => write!(f, "bad commune query kind {}", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalPacket {
    pub info: SigInfo,
    pub sender_pid: u32,
    pub target_tid: ThreadId,
    pub mask_ref: Option<HandleId>,
    pub completion_ref: Option<HandleId>,
    pub query: Option<CommuneQuery>,
    pub response_ref: Option<HandleId>,
}

impl SignalPacket {
    pub fn signal(info: SigInfo, sender_pid: u32) -> Self {
        SignalPacket {
            info,
            sender_pid,
            ..Default::default()
        }
    }

    pub fn control(op: ControlOp, sender_pid: u32) -> Self {
        SignalPacket {
            info: SigInfo {
                signo: op.signo(),
                pid: sender_pid,
                ..Default::default()
            },
            sender_pid,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> Result<PacketKind, PacketError> {
        let signo = self.info.signo;
        if (0..=NSIG as i32).contains(&signo) {
            Ok(PacketKind::Signal(signo as u32))
        } else {
            ControlOp::from_signo(signo)
                .map(PacketKind::Control)
                .ok_or(PacketError::BadSignal(signo))
        }
    }

    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let (query_kind, query_arg) = self.query.map(|q| q.to_wire()).unwrap_or((0, 0));
        let mut buf = [0u8; PACKET_SIZE];
        put_i32(&mut buf, 0, self.info.signo);
        put_i32(&mut buf, 4, self.info.code);
        put_i32(&mut buf, 8, self.info.errno);
        put_u32(&mut buf, 12, self.info.pid);
        put_u32(&mut buf, 16, self.info.uid);
        put_u32(&mut buf, 20, self.sender_pid);
        buf[24..32].copy_from_slice(&self.info.value.to_le_bytes());
        buf[32..40].copy_from_slice(&self.info.addr.to_le_bytes());
        put_u32(&mut buf, 40, self.target_tid);
        put_u32(&mut buf, 44, HandleId::to_wire(self.mask_ref));
        put_u32(&mut buf, 48, HandleId::to_wire(self.completion_ref));
        buf[52..54].copy_from_slice(&query_kind.to_le_bytes());
        put_i32(&mut buf, 56, query_arg);
        put_u32(&mut buf, 60, HandleId::to_wire(self.response_ref));
        buf
    }

    pub fn decode(buf: &[u8; PACKET_SIZE]) -> Result<SignalPacket, PacketError> {
        let info = SigInfo {
            signo: get_i32(buf, 0),
            code: get_i32(buf, 4),
            errno: get_i32(buf, 8),
            pid: get_u32(buf, 12),
            uid: get_u32(buf, 16),
            value: get_u64(buf, 24),
            addr: get_u64(buf, 32),
        };
        let query_kind = u16::from_le_bytes([buf[52], buf[53]]);
        let query = if query_kind == 0 {
            None
        } else {
            Some(
                CommuneQuery::from_wire(query_kind, get_i32(buf, 56))
                    .ok_or(PacketError::BadQuery(query_kind))?,
            )
        };
        let packet = SignalPacket {
            info,
            sender_pid: get_u32(buf, 20),
            target_tid: get_u32(buf, 40),
            mask_ref: HandleId::from_wire(get_u32(buf, 44)),
            completion_ref: HandleId::from_wire(get_u32(buf, 48)),
            query,
            response_ref: HandleId::from_wire(get_u32(buf, 60)),
        };
        packet.kind()?;
        Ok(packet)
    }
}

fn put_u32(buf: &mut [u8; PACKET_SIZE], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut [u8; PACKET_SIZE], at: usize, v: i32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8; PACKET_SIZE], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_i32(buf: &[u8; PACKET_SIZE], at: usize) -> i32 {
    get_u32(buf, at) as i32
}

fn get_u64(buf: &[u8; PACKET_SIZE], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
