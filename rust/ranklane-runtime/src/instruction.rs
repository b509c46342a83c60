//! Instruction messages: what callers submit to the scheduler.
//!
//! An [`InstructionMsg`] names an [`Opcode`], the operands it reads or
//! writes, and the stream lane it must run on. Messages are plain data until
//! the scheduler admits them; after admission they are frozen into a
//! [`Dispatch`] that the lane worker executes exactly once.

use crate::boxing::BoxingStep;
use crate::completion::{Continuation, InstructionOutcome};
use ranklane_core::{
    LogicalObjectId, ObjectScope, RankGroupCmd, RankGroupId, SymbolKind, VmError, VmResult,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Ids, operands, streams
// ---------------------------------------------------------------------------

/// Scheduler-assigned id of an admitted instruction. Ids increase in
/// admission order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstructionId(pub(crate) u64);

impl InstructionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
}

/// One operand reference: an object id plus how the instruction uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operand {
    pub object: LogicalObjectId,
    pub access: Access,
}

impl Operand {
    pub fn read(object: LogicalObjectId) -> Self {
        Self {
            object,
            access: Access::Read,
        }
    }

    pub fn write(object: LogicalObjectId) -> Self {
        Self {
            object,
            access: Access::Write,
        }
    }

    pub fn is_write(&self) -> bool {
        self.access == Access::Write
    }
}

/// Target lane of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "stream", content = "index", rename_all = "snake_case")]
pub enum StreamClass {
    /// The single control lane; symbol lifecycle and rank-group commands.
    Control,
    /// Compute lane `n`.
    Compute(u16),
    /// Outbound network lane to the given peer rank.
    Network(u16),
}

impl fmt::Display for StreamClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamClass::Control => write!(f, "control"),
            StreamClass::Compute(n) => write!(f, "compute-{}", n),
            StreamClass::Network(peer) => write!(f, "net-{}", peer),
        }
    }
}

// ---------------------------------------------------------------------------
// Opcode
// ---------------------------------------------------------------------------

/// What an instruction does. Built-in opcodes are closed variants; user data
/// opcodes go through [`Opcode::Kernel`] and the opcode table.
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    /// Register a symbol. Operands: `[Write(id)]`.
    NewSymbol {
        kind: SymbolKind,
        scope: ObjectScope,
        /// One value per instance, or a single value replicated to every
        /// instance.
        instances: Vec<Value>,
    },
    /// Tear a symbol down. Operands: `[Write(id)]`.
    DeleteSymbol,
    /// Check that every rank of a group holds the same symbol value.
    /// Operands: `[Read(id)]`.
    SyncSymbol { group: RankGroupId },
    /// Rank-group barrier. No operands.
    Barrier { group: RankGroupId },
    /// Transmit one blob instance to `peer`. Operands: `[Read(blob)]`.
    Send { peer: u16, parallel_id: usize },
    /// Receive one blob instance from `peer`. Operands: `[Write(blob)]`.
    Recv { peer: u16, parallel_id: usize },
    /// One output piece of a boxing step. Operands: `[Read(src), Write(dst)]`.
    Boxing(BoxingStep),
    /// A registered data opcode.
    Kernel { name: String, attrs: Value },
}

/// Names reserved by the built-in opcodes.
pub const BUILTIN_OPCODES: &[&str] = &[
    "new_symbol",
    "delete_symbol",
    "sync_symbol",
    "barrier",
    "send",
    "recv",
    "boxing",
];

impl Opcode {
    pub fn name(&self) -> &str {
        match self {
            Opcode::NewSymbol { .. } => "new_symbol",
            Opcode::DeleteSymbol => "delete_symbol",
            Opcode::SyncSymbol { .. } => "sync_symbol",
            Opcode::Barrier { .. } => "barrier",
            Opcode::Send { .. } => "send",
            Opcode::Recv { .. } => "recv",
            Opcode::Boxing(_) => "boxing",
            Opcode::Kernel { name, .. } => name,
        }
    }

    /// Whether the opcode runs on the control lane.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Opcode::NewSymbol { .. }
                | Opcode::DeleteSymbol
                | Opcode::SyncSymbol { .. }
                | Opcode::Barrier { .. }
        )
    }
}

/// The rank-group command that synchronizes symbols of `kind`, if any.
pub fn sync_cmd_for(kind: SymbolKind) -> Option<RankGroupCmd> {
    match kind {
        SymbolKind::ParallelDesc => Some(RankGroupCmd::SyncSymbolParallelDesc),
        SymbolKind::Distribution => Some(RankGroupCmd::SyncSymbolDistribution),
        SymbolKind::ConsistentTensorMeta => Some(RankGroupCmd::SyncSymbolConsistentTensorMeta),
        SymbolKind::Blob => None,
    }
}

// ---------------------------------------------------------------------------
// InstructionMsg
// ---------------------------------------------------------------------------

/// A unit of work awaiting admission.
pub struct InstructionMsg {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub stream: StreamClass,
    pub(crate) continuation: Option<Continuation>,
}

impl InstructionMsg {
    pub fn new(opcode: Opcode, operands: Vec<Operand>, stream: StreamClass) -> Self {
        Self {
            opcode,
            operands,
            stream,
            continuation: None,
        }
    }

    pub fn new_symbol(
        id: LogicalObjectId,
        kind: SymbolKind,
        scope: ObjectScope,
        instances: Vec<Value>,
    ) -> Self {
        Self::new(
            Opcode::NewSymbol {
                kind,
                scope,
                instances,
            },
            vec![Operand::write(id)],
            StreamClass::Control,
        )
    }

    pub fn delete_symbol(id: LogicalObjectId) -> Self {
        Self::new(
            Opcode::DeleteSymbol,
            vec![Operand::write(id)],
            StreamClass::Control,
        )
    }

    pub fn sync_symbol(id: LogicalObjectId, group: RankGroupId) -> Self {
        Self::new(
            Opcode::SyncSymbol { group },
            vec![Operand::read(id)],
            StreamClass::Control,
        )
    }

    pub fn barrier(group: RankGroupId) -> Self {
        Self::new(Opcode::Barrier { group }, Vec::new(), StreamClass::Control)
    }

    pub fn send(blob: LogicalObjectId, peer: u16, parallel_id: usize) -> Self {
        Self::new(
            Opcode::Send { peer, parallel_id },
            vec![Operand::read(blob)],
            StreamClass::Network(peer),
        )
    }

    pub fn recv(blob: LogicalObjectId, peer: u16, parallel_id: usize) -> Self {
        Self::new(
            Opcode::Recv { peer, parallel_id },
            vec![Operand::write(blob)],
            StreamClass::Network(peer),
        )
    }

    pub fn boxing(
        src: LogicalObjectId,
        dst: LogicalObjectId,
        step: BoxingStep,
        lane: u16,
    ) -> Self {
        Self::new(
            Opcode::Boxing(step),
            vec![Operand::read(src), Operand::write(dst)],
            StreamClass::Compute(lane),
        )
    }

    /// A registered data opcode on the given lane.
    pub fn kernel(
        name: impl Into<String>,
        stream: StreamClass,
        operands: Vec<Operand>,
        attrs: Value,
    ) -> Self {
        Self::new(
            Opcode::Kernel {
                name: name.into(),
                attrs,
            },
            operands,
            stream,
        )
    }

    /// Attach a continuation that runs on the lane thread right before the
    /// completion handle resolves.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&InstructionOutcome) + Send + 'static,
    {
        self.continuation = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for InstructionMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionMsg")
            .field("opcode", &self.opcode.name())
            .field("operands", &self.operands)
            .field("stream", &self.stream)
            .field("has_continuation", &self.continuation.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// An admitted instruction, shared between the scheduler and the lane that
/// runs it.
#[derive(Debug)]
pub struct Dispatch {
    pub id: InstructionId,
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub stream: StreamClass,
}

impl Dispatch {
    pub fn operand(&self, index: usize) -> VmResult<Operand> {
        self.operands.get(index).copied().ok_or_else(|| {
            VmError::InvalidInstruction(format!(
                "{} {} has no operand {}",
                self.opcode.name(),
                self.id,
                index
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranklane_core::IdMinter;

    #[test]
    fn builders_pick_lane_and_access() {
        let minter = IdMinter::new();
        let a = minter.mint();
        let b = minter.mint();

        let msg = InstructionMsg::new_symbol(
            a,
            SymbolKind::Blob,
            ObjectScope::Consistent,
            vec![Value::Null],
        );
        assert_eq!(msg.stream, StreamClass::Control);
        assert_eq!(msg.operands, vec![Operand::write(a)]);

        let msg = InstructionMsg::send(a, 3, 0);
        assert_eq!(msg.stream, StreamClass::Network(3));
        assert!(!msg.operands[0].is_write());

        let msg = InstructionMsg::kernel(
            "scale",
            StreamClass::Compute(1),
            vec![Operand::read(a), Operand::write(b)],
            Value::Null,
        );
        assert_eq!(msg.opcode.name(), "scale");
        assert!(!msg.opcode.is_control());
    }

    #[test]
    fn blobs_have_no_sync_command() {
        assert_eq!(sync_cmd_for(SymbolKind::Blob), None);
        assert_eq!(
            sync_cmd_for(SymbolKind::Distribution),
            Some(RankGroupCmd::SyncSymbolDistribution)
        );
    }

    #[test]
    fn stream_class_display() {
        assert_eq!(StreamClass::Compute(2).to_string(), "compute-2");
        assert_eq!(StreamClass::Network(7).to_string(), "net-7");
    }

    #[test]
    fn dispatch_operand_out_of_range_is_invalid() {
        let a = IdMinter::new().mint();
        let dispatch = Dispatch {
            id: InstructionId(9),
            opcode: Opcode::DeleteSymbol,
            operands: vec![Operand::write(a)],
            stream: StreamClass::Control,
        };
        assert_eq!(dispatch.operand(0).unwrap(), Operand::write(a));
        assert!(matches!(dispatch.operand(1), Err(VmError::InvalidInstruction(_))));
    }

    #[test]
    fn continuation_is_reported_in_debug() {
        let group = ranklane_core::RankGroupTable::new().register([0]).unwrap();
        let msg = InstructionMsg::barrier(group.id).on_complete(|_| {});
        assert!(format!("{:?}", msg).contains("has_continuation: true"));
    }
}
