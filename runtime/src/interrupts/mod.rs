//! Hardware exception handling

pub mod exception;

pub use exception::{
    raise_exception, translate, Backing, DebuggerAction, DebuggerHook, ExceptionCode, FaultOutcome,
    FaultRecord, FaultReport, FlatMemoryMap, MemoryMap, Region, Registers,
};
