//! Registered data opcodes.
//!
//! Built-in opcodes (symbol lifecycle, rank-group commands, send/recv,
//! boxing) are closed enum variants. Everything else is a named
//! [`InstructionKernel`] with a [`KernelSignature`] that the scheduler checks
//! at admission time, so a malformed instruction never reaches a lane.

use crate::instruction::{Access, InstructionId, Operand, StreamClass, BUILTIN_OPCODES};
use crate::registry::ObjectEntry;
use crate::scheduler::Scheduler;
use parking_lot::RwLock;
use ranklane_core::{SymbolKind, SymbolState, VmError, VmResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Which lane family a data opcode may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Compute,
    Network,
}

impl StreamKind {
    pub fn admits(self, stream: StreamClass) -> bool {
        matches!(
            (self, stream),
            (StreamKind::Compute, StreamClass::Compute(_))
                | (StreamKind::Network, StreamClass::Network(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandSpec {
    pub access: Access,
    pub kind: SymbolKind,
}

impl OperandSpec {
    pub fn read(kind: SymbolKind) -> Self {
        Self {
            access: Access::Read,
            kind,
        }
    }

    pub fn write(kind: SymbolKind) -> Self {
        Self {
            access: Access::Write,
            kind,
        }
    }
}

/// Lane family plus the ordered operand list an opcode expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSignature {
    pub stream: StreamKind,
    pub operands: Vec<OperandSpec>,
}

impl KernelSignature {
    pub fn compute(operands: Vec<OperandSpec>) -> Self {
        Self {
            stream: StreamKind::Compute,
            operands,
        }
    }

    pub fn network(operands: Vec<OperandSpec>) -> Self {
        Self {
            stream: StreamKind::Network,
            operands,
        }
    }

    /// Check an instruction against this signature. `kinds[i]` is the
    /// registered kind of `operands[i]`.
    pub fn check(
        &self,
        name: &str,
        stream: StreamClass,
        operands: &[Operand],
        kinds: &[SymbolKind],
    ) -> VmResult<()> {
        if !self.stream.admits(stream) {
            return Err(VmError::InvalidInstruction(format!(
                "{} runs on {:?} lanes, not {}",
                name, self.stream, stream
            )));
        }
        if operands.len() != self.operands.len() {
            return Err(VmError::InvalidInstruction(format!(
                "{} takes {} operands, got {}",
                name,
                self.operands.len(),
                operands.len()
            )));
        }
        let expected = operands.iter().zip(kinds).zip(&self.operands);
        for (i, ((operand, kind), spec)) in expected.enumerate() {
            if operand.access != spec.access || *kind != spec.kind {
                return Err(VmError::InvalidInstruction(format!(
                    "{} operand {} must be {:?} {}, got {:?} {}",
                    name, i, spec.access, spec.kind, operand.access, kind
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kernel trait
// ---------------------------------------------------------------------------

/// The side effect of a data opcode. Runs on a lane thread with its
/// operands already resolved.
pub trait InstructionKernel: Send + Sync {
    fn execute(&self, ctx: &mut KernelContext<'_>) -> VmResult<()>;
}

impl<F> InstructionKernel for F
where
    F: Fn(&mut KernelContext<'_>) -> VmResult<()> + Send + Sync,
{
    fn execute(&self, ctx: &mut KernelContext<'_>) -> VmResult<()> {
        self(ctx)
    }
}

/// Wrap a closure as a shareable kernel.
pub fn kernel_fn<F>(f: F) -> Arc<dyn InstructionKernel>
where
    F: Fn(&mut KernelContext<'_>) -> VmResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a kernel sees while it runs.
pub struct KernelContext<'a> {
    instruction: InstructionId,
    rank: u16,
    attrs: &'a Value,
    operands: Vec<(Operand, Arc<ObjectEntry>)>,
    scheduler: &'a Scheduler,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        instruction: InstructionId,
        rank: u16,
        attrs: &'a Value,
        operands: Vec<(Operand, Arc<ObjectEntry>)>,
        scheduler: &'a Scheduler,
    ) -> Self {
        Self {
            instruction,
            rank,
            attrs,
            operands,
            scheduler,
        }
    }

    pub fn instruction_id(&self) -> InstructionId {
        self.instruction
    }

    pub fn rank(&self) -> u16 {
        self.rank
    }

    pub fn attrs(&self) -> &Value {
        self.attrs
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    fn entry(&self, index: usize) -> VmResult<&(Operand, Arc<ObjectEntry>)> {
        self.operands.get(index).ok_or_else(|| {
            VmError::InvalidState(format!(
                "{} has no operand {}",
                self.instruction, index
            ))
        })
    }

    pub fn object(&self, index: usize) -> VmResult<&Arc<ObjectEntry>> {
        Ok(&self.entry(index)?.1)
    }

    pub fn read(&self, index: usize, parallel_id: usize) -> VmResult<Value> {
        self.entry(index)?.1.read(parallel_id)
    }

    /// Fails with `InvalidState` unless the operand was declared `Write`.
    pub fn write(&mut self, index: usize, parallel_id: usize, value: Value) -> VmResult<()> {
        let (operand, entry) = self.entry(index)?;
        if !operand.is_write() {
            return Err(VmError::InvalidState(format!(
                "{} operand {} ({}) is read-only",
                self.instruction, index, operand.object
            )));
        }
        entry.write(parallel_id, value)
    }

    /// Lifecycle state of an operand as the scheduler sees it right now.
    pub fn symbol_state(&self, index: usize) -> VmResult<SymbolState> {
        let object = self.entry(index)?.0.object;
        Ok(self.scheduler.symbol_state(object))
    }
}

impl fmt::Debug for KernelContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelContext")
            .field("instruction", &self.instruction)
            .field("rank", &self.rank)
            .field("operands", &self.operands.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// OpcodeTable
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct RegisteredOpcode {
    signature: KernelSignature,
    kernel: Arc<dyn InstructionKernel>,
}

/// Name -> (signature, kernel). Registration may happen while the VM runs.
#[derive(Default)]
pub struct OpcodeTable {
    entries: RwLock<HashMap<String, RegisteredOpcode>>,
}

impl OpcodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        signature: KernelSignature,
        kernel: Arc<dyn InstructionKernel>,
    ) -> VmResult<()> {
        let name = name.into();
        if name.is_empty() || BUILTIN_OPCODES.contains(&name.as_str()) {
            return Err(VmError::InvalidInstruction(format!(
                "opcode name '{}' is reserved",
                name
            )));
        }
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(VmError::InvalidInstruction(format!(
                "opcode '{}' is already registered",
                name
            )));
        }
        entries.insert(name, RegisteredOpcode { signature, kernel });
        Ok(())
    }

    pub fn signature(&self, name: &str) -> Option<KernelSignature> {
        self.entries.read().get(name).map(|r| r.signature.clone())
    }

    pub fn kernel(&self, name: &str) -> Option<Arc<dyn InstructionKernel>> {
        self.entries.read().get(name).map(|r| Arc::clone(&r.kernel))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for OpcodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcodeTable")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranklane_core::IdMinter;

    fn noop() -> Arc<dyn InstructionKernel> {
        kernel_fn(|_| Ok(()))
    }

    #[test]
    fn duplicate_and_reserved_names_are_rejected() {
        let table = OpcodeTable::new();
        let sig = KernelSignature::compute(vec![OperandSpec::write(SymbolKind::Blob)]);
        table.register("fill", sig.clone(), noop()).unwrap();
        assert!(matches!(
            table.register("fill", sig.clone(), noop()),
            Err(VmError::InvalidInstruction(_))
        ));
        assert!(table.register("send", sig.clone(), noop()).is_err());
        assert!(table.register("", sig, noop()).is_err());
        assert_eq!(table.names(), vec!["fill".to_string()]);
    }

    #[test]
    fn signature_checks_lane_arity_access_and_kind() {
        let minter = IdMinter::new();
        let (a, b) = (minter.mint(), minter.mint());
        let sig = KernelSignature::compute(vec![
            OperandSpec::read(SymbolKind::Blob),
            OperandSpec::write(SymbolKind::Blob),
        ]);
        let ops = [Operand::read(a), Operand::write(b)];
        let blobs = [SymbolKind::Blob, SymbolKind::Blob];

        sig.check("axpy", StreamClass::Compute(0), &ops, &blobs).unwrap();
        assert!(sig.check("axpy", StreamClass::Control, &ops, &blobs).is_err());
        assert!(sig
            .check("axpy", StreamClass::Compute(0), &ops[..1], &blobs[..1])
            .is_err());
        assert!(sig
            .check(
                "axpy",
                StreamClass::Compute(0),
                &[Operand::write(a), Operand::write(b)],
                &blobs
            )
            .is_err());
        assert!(sig
            .check(
                "axpy",
                StreamClass::Compute(0),
                &ops,
                &[SymbolKind::Distribution, SymbolKind::Blob]
            )
            .is_err());
    }
}
