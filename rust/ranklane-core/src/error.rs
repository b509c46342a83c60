//! Error taxonomy shared by every ranklane crate.
//!
//! The variants follow the point at which a failure is detected:
//!
//! * admit-time rejections ([`VmError::InvalidInstruction`],
//!   [`VmError::InvalidState`]) never leave partial state behind;
//! * [`VmError::ResourceExhausted`] is transient and worth retrying;
//! * [`VmError::UnsupportedBoxing`] is a configuration error;
//! * execute-time failures ([`VmError::ExecutionFailed`],
//!   [`VmError::UpstreamFailed`], [`VmError::Abandoned`]) are delivered
//!   through an instruction's completion, exactly once.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// Malformed instruction: unknown opcode, wrong stream class, or an
    /// operand whose symbol kind does not match the opcode signature.
    #[error("invalid instruction: {0}")]
    InvalidInstruction(String),
    /// A bounded coordination pool has no free slot.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// A token or object was accessed as the wrong variant, or outside the
    /// window in which it is live.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// No boxing strategy exists for the requested endpoints.
    #[error("unsupported boxing: {0}")]
    UnsupportedBoxing(String),
    /// The instruction ran and its side effect failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    /// The instruction was never run because a producer it depends on
    /// failed. `root` is the instruction whose failure started the chain.
    #[error("instruction #{instruction} not run: upstream instruction #{root} failed")]
    UpstreamFailed { instruction: u64, root: u64 },
    /// The VM shut down before the instruction could run.
    #[error("instruction #{0} abandoned before execution")]
    Abandoned(u64),
}

impl VmError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            VmError::InvalidInstruction(_) => "invalid_instruction",
            VmError::ResourceExhausted(_) => "resource_exhausted",
            VmError::InvalidState(_) => "invalid_state",
            VmError::UnsupportedBoxing(_) => "unsupported_boxing",
            VmError::ExecutionFailed(_) => "execution_failed",
            VmError::UpstreamFailed { .. } => "upstream_failed",
            VmError::Abandoned(_) => "abandoned",
        }
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VmError::ResourceExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_root_of_upstream_failure() {
        let err = VmError::UpstreamFailed {
            instruction: 7,
            root: 3,
        };
        assert_eq!(
            err.to_string(),
            "instruction #7 not run: upstream instruction #3 failed"
        );
        assert_eq!(err.kind(), "upstream_failed");
    }

    #[test]
    fn only_resource_exhaustion_is_transient() {
        assert!(VmError::ResourceExhausted("uid".into()).is_transient());
        assert!(!VmError::InvalidState("x".into()).is_transient());
        assert!(!VmError::ExecutionFailed("x".into()).is_transient());
    }
}
