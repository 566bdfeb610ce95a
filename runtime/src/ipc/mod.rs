//! Inter-process plumbing: pipes, capability handles and commune queries

pub mod commune;
pub mod handle;
pub mod pipe;

pub use handle::{Capability, HandleId, HandleTable};
pub use pipe::{pipe, PipeError, PipeReader, PipeWriter};
