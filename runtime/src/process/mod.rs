//! Process management
//!
//! The process table lives in a [`Host`]. Each process owns its signal
//! state, its children's records and the channel its dispatcher reads.

pub mod fork;
pub mod manager;
#[allow(clippy::module_inception)]
pub mod process;
pub mod services;
pub mod wait;

pub use fork::ForkOptions;
pub use manager::{AttachGuard, Host, Terminal, TtyId};
pub(crate) use process::ChannelState;
pub use process::{Process, ProcessId, ProcessInner, ProcessState};
pub use services::{ProcessServices, StaticServices};
pub use wait::{ResourceUsage, WaitFilter, WaitOptions, WaitResult, WaitStatus};
