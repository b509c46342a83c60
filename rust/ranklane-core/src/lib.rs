//! Ranklane Core
//!
//! Value types shared by the VM runtime and its callers: RPC tokens and
//! their 64-bit codec, coordination-id pools, logical object ids, placement
//! descriptors and the error taxonomy.

pub mod coordination;
pub mod error;
pub mod placement;
pub mod symbol;
pub mod token;

pub use coordination::{RankGroup, RankGroupId, RankGroupTable, ThreadUidPool, TokenFactory};
pub use error::{VmError, VmResult};
pub use placement::{BoxingEndpoint, DeviceKind, Distribution, Placement};
pub use symbol::{IdMinter, LogicalObjectId, ObjectScope, SymbolKind, SymbolState};
pub use token::{RankGroupCmd, RpcToken, TokenType};
