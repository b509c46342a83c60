//! Logical object ids and the symbol lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use strum::Display;

// ---------------------------------------------------------------------------
// LogicalObjectId
// ---------------------------------------------------------------------------

/// Identifies one logical object (a symbol) across all ranks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalObjectId(u64);

impl LogicalObjectId {
    /// Wrap a raw id. Ids built this way bypass [`IdMinter`] and are meant
    /// for decoding ids that a peer minted.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for LogicalObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalObjectId({})", self.0)
    }
}

impl fmt::Display for LogicalObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// Hands out fresh object ids. An id is never handed out twice by the same
/// minter, which is what keeps a retired id from aliasing a new object.
#[derive(Debug)]
pub struct IdMinter {
    next: AtomicU64,
}

impl Default for IdMinter {
    fn default() -> Self {
        Self::new()
    }
}

impl IdMinter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn mint(&self) -> LogicalObjectId {
        LogicalObjectId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// SymbolKind / ObjectScope / SymbolState
// ---------------------------------------------------------------------------

/// What a logical object stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SymbolKind {
    /// Placement of an op: device kind plus participating ranks.
    ParallelDesc,
    /// Split / broadcast / partial-sum distribution descriptor.
    Distribution,
    /// Shape, dtype and placement of a consistent tensor.
    ConsistentTensorMeta,
    /// A buffer that data instructions read and write.
    Blob,
}

/// Whether a logical object has one instance per rank or one shared value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ObjectScope {
    /// One physical instance per parallel index.
    Mirrored { parallel_num: usize },
    /// A single globally agreed instance.
    Consistent,
}

impl ObjectScope {
    /// Number of physical instances the registry holds for this scope.
    pub fn instance_count(&self) -> usize {
        match self {
            ObjectScope::Mirrored { parallel_num } => *parallel_num,
            ObjectScope::Consistent => 1,
        }
    }
}

/// Lifecycle of a logical object id.
///
/// `Unregistered -> Registering -> Live -> Deleting -> Unregistered`; an id
/// that reached the final `Unregistered` is retired and never valid again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SymbolState {
    Unregistered,
    Registering,
    Live,
    Deleting,
}
