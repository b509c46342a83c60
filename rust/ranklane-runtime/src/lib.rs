//! Ranklane Runtime
//!
//! The per-rank instruction VM: a dependency-tracking scheduler feeding
//! control, compute and network lanes, the logical object registry, the
//! token-addressed RPC layer and boxing between distributions.

pub mod boxing;
pub mod completion;
pub mod config;
pub mod control;
pub mod instruction;
pub mod logging;
pub mod opcode;
pub mod registry;
pub mod rpc;
mod scheduler;
pub mod stream;
pub mod vm;

pub use boxing::{BoxingDispatcher, BoxingKernel, BoxingRequest, BoxingStep, BoxingStrategy};
pub use completion::{CompletionHandle, InstructionOutcome};
pub use config::{ConfigError, VmConfig};
pub use instruction::{Access, InstructionId, InstructionMsg, Opcode, Operand, StreamClass};
pub use opcode::{
    kernel_fn, InstructionKernel, KernelContext, KernelSignature, OpcodeTable, OperandSpec,
    StreamKind,
};
pub use registry::{ObjectEntry, ObjectRegistry};
pub use rpc::{LoopbackHub, LoopbackTransport, Transport, TransportError};
pub use scheduler::SchedulerStats;
pub use vm::{VirtualMachine, VmBuilder};
