//! Per-process signal dispatcher
//!
//! One thread per process reads packets from the signal channel in order
//! and decides what each one means: drop it, queue it as pending, hand it
//! to a `sigwait`er, arm a thread with it, stop or continue the process,
//! or terminate it. Control packets drive the pending queue, hold state,
//! introspection and shutdown.
//!
//! The dispatcher never blocks on the threads it serves. Whatever it does
//! for a packet, it signals the packet's completion object afterwards.

use std::sync::Arc;

use super::constants::*;
use super::interrupt::{ArmError, RetryPolicy};
use super::packet::{ControlOp, PacketKind, SignalPacket, PACKET_SIZE};
use super::types::{default_action, SaFlags, SigHandler, SigInfo, SignalAction, SignalDefaultAction};
use crate::ipc::commune;
use crate::ipc::pipe::PipeReader;
use crate::process::wait::{ChildEvent, WaitStatus};
use crate::process::{Process, ProcessState};
use crate::signal::pending::PendingEntry;
use crate::syscall::errno::Errno;
use crate::task::{ArmedSignal, Thread, ThreadId};

/// Start the dispatcher thread for `process`
pub(crate) fn start(process: &Arc<Process>, reader: PipeReader) -> Result<(), Errno> {
    let dispatcher = Dispatcher {
        process: process.clone(),
    };
    std::thread::Builder::new()
        .name(format!("sig-{}", process.id))
        .spawn(move || dispatcher.run(reader))
        .map(|_| ())
        .map_err(|e| {
            log::error!("process {}: cannot start dispatcher: {}", process.id, e);
            Errno::EAGAIN
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Continue,
    Shutdown,
}

/// What to do with a signal, decided under the process lock
enum Decision {
    Drop,
    Pending(PendingEntry),
    Handed(Arc<Thread>),
    Terminate(WaitStatus),
    Stop(u32),
    Arm(Vec<Arc<Thread>>, ArmedSignal, ThreadId),
}

struct Dispatcher {
    process: Arc<Process>,
}

impl Dispatcher {
    fn run(mut self, reader: PipeReader) {
        log::debug!("process {}: dispatcher running", self.process.id);
        let mut buf = [0u8; PACKET_SIZE];
        loop {
            if let Err(e) = reader.read_exact(&mut buf) {
                log::debug!("process {}: channel closed: {}", self.process.id, e);
                break;
            }
            let packet = match SignalPacket::decode(&buf) {
                Ok(packet) => packet,
                Err(e) => {
                    self.violation(&format!("undecodable packet: {}", e));
                    break;
                }
            };
            let completion = match packet.completion_ref {
                Some(id) => {
                    let taken = self.process.handles().take_completion(id);
                    match taken {
                        Ok(event) => Some(event),
                        Err(e) => {
                            self.violation(&format!("bad completion handle: {}", e));
                            break;
                        }
                    }
                }
                None => None,
            };

            let outcome = self.dispatch(&packet);
            if let Some(event) = completion {
                event.set();
            }
            if outcome == Outcome::Shutdown {
                break;
            }
        }
        drop(reader);
        self.process.set_dispatcher_done();
        log::debug!("process {}: dispatcher stopped", self.process.id);
    }

    fn dispatch(&mut self, packet: &SignalPacket) -> Outcome {
        match packet.kind() {
            Ok(PacketKind::Signal(0)) => Outcome::Continue,
            Ok(PacketKind::Signal(_)) => self.deliver(packet.info, packet.target_tid),
            Ok(PacketKind::Control(op)) => self.control(op, packet),
            Err(e) => self.violation(&e.to_string()),
        }
    }

    fn control(&mut self, op: ControlOp, packet: &SignalPacket) -> Outcome {
        log::trace!("process {}: control {:?} from {}", self.process.id, op, packet.sender_pid);
        match op {
            ControlOp::Flush | ControlOp::FlushFast => self.flush(),
            ControlOp::Pending => {
                let Some(id) = packet.mask_ref else {
                    return self.violation("pending query without a mask slot");
                };
                let taken = self.process.handles().take_mask(id);
                let slot = match taken {
                    Ok(slot) => slot,
                    Err(e) => return self.violation(&format!("bad mask handle: {}", e)),
                };
                slot.store(self.process.pending_bits());
                Outcome::Continue
            }
            ControlOp::Hold => {
                self.process.lock().held = true;
                Outcome::Continue
            }
            ControlOp::NoHold => {
                self.process.lock().held = false;
                self.flush()
            }
            ControlOp::Commune => self.commune(packet),
            ControlOp::ThreadExit => {
                self.process.lock().pending.retarget(packet.target_tid);
                self.flush()
            }
            ControlOp::Exit => Outcome::Shutdown,
        }
    }

    /// Re-process every pending entry once, in signal-number order
    fn flush(&mut self) -> Outcome {
        let entries = self.process.lock().pending.drain();
        for entry in entries {
            if self.deliver(entry.info, entry.target) == Outcome::Shutdown {
                return Outcome::Shutdown;
            }
        }
        Outcome::Continue
    }

    fn deliver(&mut self, info: SigInfo, target: ThreadId) -> Outcome {
        let sig = info.sig();
        let mut continued = false;

        let decision = {
            let mut inner = self.process.lock();
            if inner.state == ProcessState::Exited {
                return Outcome::Continue;
            }

            if sig == SIGCONT {
                inner.pending.discard(STOP_SIGNALS);
                if inner.state == ProcessState::Stopped {
                    inner.state = ProcessState::Running;
                    inner.stop_signal = 0;
                    continued = true;
                }
            } else if is_stop_signal(sig) {
                inner.pending.remove(SIGCONT);
            }

            let entry = PendingEntry { info, target };
            let stopped = inner.state == ProcessState::Stopped;
            if sig == SIGKILL {
                Decision::Terminate(WaitStatus::signaled(SIGKILL, false))
            } else if inner.held || (stopped && sig != SIGCONT) {
                Decision::Pending(entry)
            } else if let Some(thread) = inner.threads.iter().find(|t| claim_for_sigwait(t, &info)) {
                Decision::Handed(thread.clone())
            } else {
                let candidates = candidates(&inner.threads, sig, target);
                if candidates.is_empty() {
                    Decision::Pending(entry)
                } else {
                    let action = inner.dispositions.get(sig);
                    let core_dumps = self.process.config().core_dumps;
                    let decision = resolve(sig, info, action, candidates, target, core_dumps);
                    if let Decision::Stop(stop) = decision {
                        inner.state = ProcessState::Stopped;
                        inner.stop_signal = stop;
                    }
                    decision
                }
            }
        };

        if continued {
            log::info!("process {}: continued", self.process.id);
            self.process.notify_parent(ChildEvent::Continued);
            self.process.wake_threads();
        }

        match decision {
            Decision::Drop => {
                log::trace!("process {}: dropped {}", self.process.id, signal_name(sig));
            }
            Decision::Pending(entry) => self.make_pending(entry),
            Decision::Handed(thread) => {
                log::debug!("process {}: {} taken by sigwait in thread {}", self.process.id, signal_name(sig), thread.tid);
                thread.unpark();
            }
            Decision::Terminate(status) => {
                log::info!("process {}: terminated by {}", self.process.id, signal_name(sig));
                self.process.exit_from_dispatcher(status);
                return Outcome::Shutdown;
            }
            Decision::Stop(sig) => {
                log::info!("process {}: stopped by {}", self.process.id, signal_name(sig));
                self.process.notify_parent(ChildEvent::Stopped(sig));
            }
            Decision::Arm(candidates, armed, target) => self.arm(candidates, armed, target),
        }

        if continued {
            // Signals that queued up while stopped are deliverable now
            return self.flush();
        }
        Outcome::Continue
    }

    fn arm(&mut self, candidates: Vec<Arc<Thread>>, armed: ArmedSignal, target: ThreadId) {
        let config = self.process.config();
        let policy = RetryPolicy::new(config.arm_retries, config.arm_yield);
        let backend = self.process.backend();
        let sig = armed.info.sig();

        for thread in &candidates {
            match policy.run(|| backend.arm(thread, &armed)) {
                Ok(_) => {
                    log::debug!("process {}: armed thread {} with {}", self.process.id, thread.tid, signal_name(sig));
                    if armed.action.flags.contains(SaFlags::RESETHAND) {
                        self.reset_handler(sig);
                    }
                    return;
                }
                // Nothing left to deliver to; the signal is moot
                Err(ArmError::TargetGone) => return,
                Err(e) => {
                    log::trace!("process {}: thread {} refused {}: {:?}", self.process.id, thread.tid, signal_name(sig), e);
                }
            }
        }
        self.make_pending(PendingEntry { info: armed.info, target });
    }

    /// One-shot handler: back to the default once a thread holds the signal
    fn reset_handler(&self, sig: u32) {
        let mut inner = self.process.lock();
        let current = inner.dispositions.get(sig);
        if current.is_user_handler() && current.flags.contains(SaFlags::RESETHAND) {
            inner.dispositions.set(sig, SignalAction::default());
        }
    }

    fn make_pending(&mut self, entry: PendingEntry) {
        let sig = entry.info.sig();
        if self.process.lock().pending.insert(entry) {
            log::trace!("process {}: {} pending", self.process.id, signal_name(sig));
        }
    }

    fn commune(&mut self, packet: &SignalPacket) -> Outcome {
        let Some(query) = packet.query else {
            return self.violation("commune packet without a query");
        };
        let Some(id) = packet.response_ref else {
            return self.violation("commune packet without a response pipe");
        };
        let taken = self.process.handles().take_response(id);
        let writer = match taken {
            Ok(writer) => writer,
            Err(e) => return self.violation(&format!("bad response handle: {}", e)),
        };
        let services = self.process.services();
        let spawned = std::thread::Builder::new()
            .name(format!("commune-{}", self.process.id))
            .spawn(move || commune::serve(query, services.as_ref(), writer));
        if let Err(e) = spawned {
            log::warn!("process {}: cannot start commune worker: {}", self.process.id, e);
        }
        Outcome::Continue
    }

    /// A peer broke the channel protocol; the receiving process dies
    fn violation(&mut self, what: &str) -> Outcome {
        log::error!("process {}: signal channel violation: {}", self.process.id, what);
        let core = self.process.config().core_dumps;
        self.process.exit_from_dispatcher(WaitStatus::signaled(SIGABRT, core));
        Outcome::Shutdown
    }
}

/// Hand `info` to `thread` if it is in `sigwait` for it
fn claim_for_sigwait(thread: &Thread, info: &SigInfo) -> bool {
    let mut state = thread.lock_state();
    if state.waited.is_none() && state.wait_set & sig_mask(info.sig()) != 0 {
        state.waited = Some(*info);
        state.wait_set = 0;
        true
    } else {
        false
    }
}

/// Threads that could take `sig`, the directed thread first
fn candidates(threads: &[Arc<Thread>], sig: u32, target: ThreadId) -> Vec<Arc<Thread>> {
    let unblocked = |t: &&Arc<Thread>| t.is_alive() && !t.lock_state().is_blocked(sig);
    if target != 0 {
        if let Some(thread) = threads.iter().find(|t| t.tid == target) {
            return Some(thread).filter(unblocked).into_iter().cloned().collect();
        }
    }
    threads.iter().filter(unblocked).cloned().collect()
}

fn resolve(
    sig: u32,
    info: SigInfo,
    action: SignalAction,
    candidates: Vec<Arc<Thread>>,
    target: ThreadId,
    core_dumps: bool,
) -> Decision {
    match action.handler {
        SigHandler::Ignore => Decision::Drop,
        SigHandler::Default => match default_action(sig) {
            SignalDefaultAction::Terminate => Decision::Terminate(WaitStatus::signaled(sig, false)),
            SignalDefaultAction::CoreDump => Decision::Terminate(WaitStatus::signaled(sig, core_dumps)),
            SignalDefaultAction::Stop => Decision::Stop(sig),
            SignalDefaultAction::Ignore | SignalDefaultAction::Continue => Decision::Drop,
        },
        SigHandler::Catch(_) => Decision::Arm(candidates, ArmedSignal::new(info, action).directed(target), target),
    }
}
