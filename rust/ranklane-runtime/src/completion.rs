//! One-shot completion delivery.
//!
//! Every admitted instruction gets exactly one outcome. The scheduler holds
//! the sending half ([`Completer`]); the caller holds a [`CompletionHandle`].
//! If the sending half disappears without resolving (the VM was torn down
//! underneath it), the handle reports [`VmError::Abandoned`] instead of
//! hanging.

use crate::instruction::InstructionId;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use ranklane_core::VmError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

/// Final result of one instruction.
pub type InstructionOutcome = Result<(), VmError>;

/// Callback run once, on the retiring thread, before the handle resolves.
pub type Continuation = Box<dyn FnOnce(&InstructionOutcome) + Send + 'static>;

pub(crate) fn pair(
    id: InstructionId,
    continuation: Option<Continuation>,
) -> (Completer, CompletionHandle) {
    let (tx, rx) = bounded(1);
    (
        Completer {
            id,
            tx,
            continuation,
        },
        CompletionHandle {
            id,
            rx,
            outcome: None,
        },
    )
}

// ---------------------------------------------------------------------------
// Completer
// ---------------------------------------------------------------------------

pub(crate) struct Completer {
    id: InstructionId,
    tx: Sender<InstructionOutcome>,
    continuation: Option<Continuation>,
}

impl Completer {
    /// Run the continuation, then publish `outcome`. Consumes the completer,
    /// so an instruction cannot be resolved twice.
    pub(crate) fn complete(mut self, outcome: InstructionOutcome) {
        if let Some(continuation) = self.continuation.take() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| continuation(&outcome)));
            if result.is_err() {
                tracing::error!(instruction = %self.id, "completion continuation panicked");
            }
        }
        // The caller may have dropped its handle; that is fine.
        let _ = self.tx.send(outcome);
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("id", &self.id)
            .field("has_continuation", &self.continuation.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CompletionHandle
// ---------------------------------------------------------------------------

/// Resolves once the instruction retires, fails, or is abandoned.
pub struct CompletionHandle {
    id: InstructionId,
    rx: Receiver<InstructionOutcome>,
    outcome: Option<InstructionOutcome>,
}

impl CompletionHandle {
    pub fn id(&self) -> InstructionId {
        self.id
    }

    /// Block until the outcome is known.
    pub fn wait(mut self) -> InstructionOutcome {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        self.rx
            .recv()
            .unwrap_or(Err(VmError::Abandoned(self.id.as_u64())))
    }

    /// Block for at most `timeout`. Returns `None` if the instruction is
    /// still pending. The outcome is cached, so this can be polled.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<InstructionOutcome> {
        if self.outcome.is_none() {
            match self.rx.recv_timeout(timeout) {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.outcome = Some(Err(VmError::Abandoned(self.id.as_u64())))
                }
            }
        }
        self.outcome.clone()
    }

    /// Non-blocking poll.
    pub fn try_outcome(&mut self) -> Option<InstructionOutcome> {
        if self.outcome.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.outcome = Some(Err(VmError::Abandoned(self.id.as_u64())))
                }
            }
        }
        self.outcome.clone()
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("id", &self.id)
            .field("resolved", &self.outcome.is_some())
            .finish()
    }
}
