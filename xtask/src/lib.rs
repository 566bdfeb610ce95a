//! posixrt xtask - test orchestration for the runtime
//!
//! Runs the workspace test suite and a handful of in-process end-to-end
//! scenarios that drive the runtime through its POSIX call surface.

mod cargo;
mod scenario;

pub use cargo::*;
pub use scenario::*;
pub use test::*;
