//! Handler trampoline
//!
//! Runs one armed signal on the current thread: widens the mask for the
//! duration of the handler, calls it, restores the mask and asks the
//! dispatcher to look at the pending queue again if anything is waiting.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use super::channel;
use super::constants::*;
use super::types::SigHandler;
use crate::task::{ArmedSignal, Context};

/// Run `armed` on the calling thread
pub fn invoke(ctx: &Context, armed: ArmedSignal) {
    let sig = armed.info.sig();
    let previous = {
        let mut state = ctx.thread.lock_state();
        let previous = state.mask;
        state.set_mask(previous | armed.delta);
        previous
    };

    log::debug!(
        "process {} thread {}: running handler for {} ({})",
        ctx.process.id,
        ctx.thread.tid,
        sig,
        signal_name(sig)
    );

    let outcome = match &armed.action.handler {
        SigHandler::Catch(handler) => {
            let handler = handler.clone();
            catch_unwind(AssertUnwindSafe(|| handler(&armed.info)))
        }
        _ => Ok(()),
    };

    let (mask, deferred) = {
        let mut state = ctx.thread.lock_state();
        let mask = state.saved_mask.take().unwrap_or(previous);
        state.set_mask(mask);
        (state.mask, core::mem::take(&mut state.deferred))
    };

    if let Err(payload) = outcome {
        resume_unwind(payload);
    }

    if deferred || ctx.process.pending_bits() & !mask != 0 {
        if let Err(e) = channel::flush(&ctx.process, true) {
            log::debug!("process {}: flush after {} failed: {}", ctx.process.id, signal_name(sig), e);
        }
    }
}
