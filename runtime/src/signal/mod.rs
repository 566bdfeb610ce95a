//! Signal handling
//!
//! Numbers and dispositions, the channel packet, the per-process dispatcher
//! and the machinery that gets an armed signal onto a thread.

pub mod channel;
pub mod constants;
pub mod delivery;
pub mod dispatcher;
pub mod interrupt;
pub mod packet;
pub mod pending;
pub mod trampoline;
pub mod types;

pub use delivery::safe_point;
pub use types::{SaFlags, SigHandler, SigInfo, SignalAction};
