//! RPC tokens: 64-bit rendezvous addresses between two ranks.
//!
//! A token names one logical message slot between a source and a
//! destination rank. Tokens are plain values; they are compared, hashed and
//! ordered by their encoded form so they can key maps on both ends of a
//! transfer.
//!
//! Encoding scheme (bit 0 is the least significant bit):
//!
//! ```text
//!  63                         34 33        18 17         2 1   0
//! +-----------------------------+------------+------------+-----+
//! |        payload (30)         |  dst (16)  |  src (16)  | tag |
//! +-----------------------------+------------+------------+-----+
//! ```
//!
//! Payload per tag:
//! - `Data`:         `data_seq_id` (30)
//! - `OpTensorMeta`: uid (3) | rank group (3) | `meta_seq_id` (24)
//! - `Cmd`:          uid (3) | rank group (3) | cmd (8) | `cmd_seq_id` (16)
//! - `Extended`:     opaque (30)

use crate::error::{VmError, VmResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use strum::{Display, EnumCount, EnumIter};

/// Number of distinct thread-consistent unique ids (3 bits).
pub const MAX_THREAD_CONSISTENT_UIDS: usize = 1 << UID_BITS;
/// Number of distinct rank-group ids (3 bits).
pub const MAX_RANK_GROUPS: usize = 1 << RANK_GROUP_BITS;

const TAG_BITS: u32 = 2;
const RANK_BITS: u32 = 16;
const PAYLOAD_BITS: u32 = 30;

const SRC_SHIFT: u32 = TAG_BITS;
const DST_SHIFT: u32 = SRC_SHIFT + RANK_BITS;
const PAYLOAD_SHIFT: u32 = DST_SHIFT + RANK_BITS;

const UID_BITS: u32 = 3;
const RANK_GROUP_BITS: u32 = 3;
const META_SEQ_BITS: u32 = 24;
const CMD_BITS: u32 = 8;
const CMD_SEQ_BITS: u32 = 16;

const RANK_GROUP_SHIFT: u32 = UID_BITS;
const TAIL_SHIFT: u32 = UID_BITS + RANK_GROUP_BITS;
const CMD_SEQ_SHIFT: u32 = TAIL_SHIFT + CMD_BITS;

const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// Largest value of a 30-bit `data_seq_id`.
pub const MAX_DATA_SEQ_ID: u32 = mask(PAYLOAD_BITS) as u32;
/// Largest value of a 24-bit `meta_seq_id`.
pub const MAX_META_SEQ_ID: u32 = mask(META_SEQ_BITS) as u32;

// ---------------------------------------------------------------------------
// TokenType / RankGroupCmd
// ---------------------------------------------------------------------------

/// The 2-bit type tag of a token.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumIter, EnumCount,
)]
#[strum(serialize_all = "snake_case")]
pub enum TokenType {
    /// Tensor data transfer between a fixed rank pair.
    Data = 0,
    /// Tensor shape / meta synchronization or checking.
    OpTensorMeta = 1,
    /// Rank-group commands (symbol sync, barriers).
    Cmd = 2,
    /// Reserved for compatibility with newer peers.
    Extended = 3,
}

impl TokenType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(TokenType::Data),
            1 => Some(TokenType::OpTensorMeta),
            2 => Some(TokenType::Cmd),
            3 => Some(TokenType::Extended),
            _ => None,
        }
    }
}

/// Command carried by a [`TokenType::Cmd`] token.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumIter, EnumCount,
)]
#[strum(serialize_all = "snake_case")]
pub enum RankGroupCmd {
    Invalid = 0,
    SyncSymbolParallelDesc = 1,
    SyncSymbolDistribution = 2,
    SyncSymbolConsistentTensorMeta = 3,
    Barrier = 4,
}

impl RankGroupCmd {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(RankGroupCmd::Invalid),
            1 => Some(RankGroupCmd::SyncSymbolParallelDesc),
            2 => Some(RankGroupCmd::SyncSymbolDistribution),
            3 => Some(RankGroupCmd::SyncSymbolConsistentTensorMeta),
            4 => Some(RankGroupCmd::Barrier),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RpcToken
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Payload {
    Data {
        seq: u32,
    },
    OpTensorMeta {
        thread_uid: u8,
        rank_group: u8,
        seq: u32,
    },
    Cmd {
        thread_uid: u8,
        rank_group: u8,
        cmd: RankGroupCmd,
        seq: u16,
    },
    Extended {
        raw: u32,
    },
}

/// A rendezvous address between `src_rank` and `dst_rank`.
///
/// Every field is range-checked on construction, so [`RpcToken::encode`] is
/// injective and `decode(encode(t)) == t` for every token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u64", try_from = "u64")]
pub struct RpcToken {
    src_rank: u16,
    dst_rank: u16,
    payload: Payload,
}

fn check_small_id(what: &str, val: u8, limit: usize) -> VmResult<()> {
    if (val as usize) < limit {
        Ok(())
    } else {
        Err(VmError::InvalidState(format!(
            "{} {} out of range (limit {})",
            what, val, limit
        )))
    }
}

fn rank_from_i64(what: &str, rank: i64) -> VmResult<u16> {
    u16::try_from(rank)
        .map_err(|_| VmError::InvalidState(format!("{} {} does not fit in 16 bits", what, rank)))
}

impl RpcToken {
    /// A `Data` token for the `src -> dst` pair with `data_seq_id == 0`.
    pub fn new_data(src_rank: u16, dst_rank: u16) -> Self {
        Self {
            src_rank,
            dst_rank,
            payload: Payload::Data { seq: 0 },
        }
    }

    /// An `OpTensorMeta` token with `meta_seq_id == 0`.
    ///
    /// Most callers go through [`TokenFactory`](crate::coordination::TokenFactory),
    /// which allocates the uid and rank-group id.
    pub fn new_op_tensor_meta(
        src_rank: u16,
        dst_rank: u16,
        thread_uid: u8,
        rank_group: u8,
    ) -> VmResult<Self> {
        check_small_id("thread consistent uid", thread_uid, MAX_THREAD_CONSISTENT_UIDS)?;
        check_small_id("rank group id", rank_group, MAX_RANK_GROUPS)?;
        Ok(Self {
            src_rank,
            dst_rank,
            payload: Payload::OpTensorMeta {
                thread_uid,
                rank_group,
                seq: 0,
            },
        })
    }

    /// A `Cmd` token naming `cmd` with `cmd_seq_id == 0`.
    pub fn new_cmd(
        src_rank: u16,
        dst_rank: u16,
        cmd: RankGroupCmd,
        thread_uid: u8,
        rank_group: u8,
    ) -> VmResult<Self> {
        check_small_id("thread consistent uid", thread_uid, MAX_THREAD_CONSISTENT_UIDS)?;
        check_small_id("rank group id", rank_group, MAX_RANK_GROUPS)?;
        Ok(Self {
            src_rank,
            dst_rank,
            payload: Payload::Cmd {
                thread_uid,
                rank_group,
                cmd,
                seq: 0,
            },
        })
    }

    /// An `Extended` token with an opaque 30-bit payload.
    pub fn new_extended(src_rank: u16, dst_rank: u16, raw: u32) -> VmResult<Self> {
        if raw as u64 > mask(PAYLOAD_BITS) {
            return Err(VmError::InvalidState(format!(
                "extended payload {:#x} exceeds 30 bits",
                raw
            )));
        }
        Ok(Self {
            src_rank,
            dst_rank,
            payload: Payload::Extended { raw },
        })
    }

    // -- accessors --------------------------------------------------------

    pub fn token_type(&self) -> TokenType {
        match self.payload {
            Payload::Data { .. } => TokenType::Data,
            Payload::OpTensorMeta { .. } => TokenType::OpTensorMeta,
            Payload::Cmd { .. } => TokenType::Cmd,
            Payload::Extended { .. } => TokenType::Extended,
        }
    }

    pub fn src_rank(&self) -> u16 {
        self.src_rank
    }

    pub fn dst_rank(&self) -> u16 {
        self.dst_rank
    }

    fn wrong_variant(&self, accessor: &str) -> VmError {
        VmError::InvalidState(format!(
            "{} is not defined for a {} token",
            accessor,
            self.token_type()
        ))
    }

    pub fn data_seq_id(&self) -> VmResult<u32> {
        match self.payload {
            Payload::Data { seq } => Ok(seq),
            _ => Err(self.wrong_variant("data_seq_id")),
        }
    }

    pub fn thread_consistent_unique_id(&self) -> VmResult<u8> {
        match self.payload {
            Payload::OpTensorMeta { thread_uid, .. } | Payload::Cmd { thread_uid, .. } => {
                Ok(thread_uid)
            }
            _ => Err(self.wrong_variant("thread_consistent_unique_id")),
        }
    }

    pub fn rank_group_id(&self) -> VmResult<u8> {
        match self.payload {
            Payload::OpTensorMeta { rank_group, .. } | Payload::Cmd { rank_group, .. } => {
                Ok(rank_group)
            }
            _ => Err(self.wrong_variant("rank_group_id")),
        }
    }

    pub fn meta_seq_id(&self) -> VmResult<u32> {
        match self.payload {
            Payload::OpTensorMeta { seq, .. } => Ok(seq),
            _ => Err(self.wrong_variant("meta_seq_id")),
        }
    }

    pub fn cmd(&self) -> VmResult<RankGroupCmd> {
        match self.payload {
            Payload::Cmd { cmd, .. } => Ok(cmd),
            _ => Err(self.wrong_variant("cmd")),
        }
    }

    pub fn cmd_seq_id(&self) -> VmResult<u16> {
        match self.payload {
            Payload::Cmd { seq, .. } => Ok(seq),
            _ => Err(self.wrong_variant("cmd_seq_id")),
        }
    }

    /// The type-specific sequence number, widened. `Extended` tokens report
    /// their raw payload.
    pub fn sequence(&self) -> u32 {
        match self.payload {
            Payload::Data { seq } | Payload::OpTensorMeta { seq, .. } => seq,
            Payload::Cmd { seq, .. } => seq as u32,
            Payload::Extended { raw } => raw,
        }
    }

    // -- setters ----------------------------------------------------------

    pub fn set_src_rank(&mut self, rank: i64) -> VmResult<()> {
        self.src_rank = rank_from_i64("src rank", rank)?;
        Ok(())
    }

    pub fn set_dst_rank(&mut self, rank: i64) -> VmResult<()> {
        self.dst_rank = rank_from_i64("dst rank", rank)?;
        Ok(())
    }

    pub fn set_data_seq_id(&mut self, seq_id: i64) -> VmResult<()> {
        if self.token_type() != TokenType::Data {
            return Err(self.wrong_variant("set_data_seq_id"));
        }
        if !(0..=MAX_DATA_SEQ_ID as i64).contains(&seq_id) {
            return Err(VmError::InvalidState(format!(
                "data_seq_id {} does not fit in 30 bits",
                seq_id
            )));
        }
        self.payload = Payload::Data {
            seq: seq_id as u32,
        };
        Ok(())
    }

    /// Advance the type-specific sequence counter in place, wrapping at the
    /// field width.
    pub fn increment(&mut self) -> &mut Self {
        match &mut self.payload {
            Payload::Data { seq } => *seq = (*seq + 1) & MAX_DATA_SEQ_ID,
            Payload::OpTensorMeta { seq, .. } => *seq = (*seq + 1) & MAX_META_SEQ_ID,
            Payload::Cmd { seq, .. } => *seq = seq.wrapping_add(1),
            Payload::Extended { raw } => *raw = (*raw + 1) & MAX_DATA_SEQ_ID,
        }
        self
    }

    /// The same channel positioned at sequence number `seq`.
    pub fn with_sequence(mut self, seq: u32) -> VmResult<Self> {
        let limit = match self.payload {
            Payload::Data { .. } | Payload::Extended { .. } => MAX_DATA_SEQ_ID,
            Payload::OpTensorMeta { .. } => MAX_META_SEQ_ID,
            Payload::Cmd { .. } => u16::MAX as u32,
        };
        if seq > limit {
            return Err(VmError::InvalidState(format!(
                "sequence {} exceeds {} for a {} token",
                seq,
                limit,
                self.token_type()
            )));
        }
        match &mut self.payload {
            Payload::Data { seq: s } | Payload::OpTensorMeta { seq: s, .. } => *s = seq,
            Payload::Cmd { seq: s, .. } => *s = seq as u16,
            Payload::Extended { raw } => *raw = seq,
        }
        Ok(self)
    }

    /// The token that follows this one on the same channel.
    pub fn next(mut self) -> Self {
        self.increment();
        self
    }

    /// The encoded token with its sequence bits cleared: equal for tokens on
    /// the same logical channel (same type, ranks and, for meta/cmd tokens,
    /// uid, rank group and command).
    pub fn channel_key(&self) -> u64 {
        let seq_mask = match self.payload {
            Payload::Data { .. } | Payload::Extended { .. } => mask(PAYLOAD_BITS),
            Payload::OpTensorMeta { .. } => mask(META_SEQ_BITS) << TAIL_SHIFT,
            Payload::Cmd { .. } => mask(CMD_SEQ_BITS) << CMD_SEQ_SHIFT,
        };
        self.encode() & !(seq_mask << PAYLOAD_SHIFT)
    }

    // -- codec ------------------------------------------------------------

    /// Pack the token into its 64-bit wire form.
    pub fn encode(&self) -> u64 {
        let (tag, payload) = match self.payload {
            Payload::Data { seq } => (TokenType::Data, seq as u64),
            Payload::OpTensorMeta {
                thread_uid,
                rank_group,
                seq,
            } => (
                TokenType::OpTensorMeta,
                thread_uid as u64
                    | (rank_group as u64) << RANK_GROUP_SHIFT
                    | (seq as u64) << TAIL_SHIFT,
            ),
            Payload::Cmd {
                thread_uid,
                rank_group,
                cmd,
                seq,
            } => (
                TokenType::Cmd,
                thread_uid as u64
                    | (rank_group as u64) << RANK_GROUP_SHIFT
                    | (cmd as u64) << TAIL_SHIFT
                    | (seq as u64) << CMD_SEQ_SHIFT,
            ),
            Payload::Extended { raw } => (TokenType::Extended, raw as u64),
        };
        tag as u64
            | (self.src_rank as u64) << SRC_SHIFT
            | (self.dst_rank as u64) << DST_SHIFT
            | (payload & mask(PAYLOAD_BITS)) << PAYLOAD_SHIFT
    }

    /// Unpack a 64-bit wire value. Fails with `InvalidState` when a `Cmd`
    /// token carries an unknown command code.
    pub fn decode(bits: u64) -> VmResult<Self> {
        let tag = (bits & mask(TAG_BITS)) as u8;
        let src_rank = ((bits >> SRC_SHIFT) & mask(RANK_BITS)) as u16;
        let dst_rank = ((bits >> DST_SHIFT) & mask(RANK_BITS)) as u16;
        let payload = (bits >> PAYLOAD_SHIFT) & mask(PAYLOAD_BITS);

        let thread_uid = (payload & mask(UID_BITS)) as u8;
        let rank_group = ((payload >> RANK_GROUP_SHIFT) & mask(RANK_GROUP_BITS)) as u8;

        // A 2-bit tag always names a valid type.
        let payload = match TokenType::from_u8(tag) {
            Some(TokenType::Data) => Payload::Data {
                seq: payload as u32,
            },
            Some(TokenType::OpTensorMeta) => Payload::OpTensorMeta {
                thread_uid,
                rank_group,
                seq: (payload >> TAIL_SHIFT) as u32,
            },
            Some(TokenType::Cmd) => {
                let code = ((payload >> TAIL_SHIFT) & mask(CMD_BITS)) as u8;
                let cmd = RankGroupCmd::from_u8(code).ok_or_else(|| {
                    VmError::InvalidState(format!("unknown rank-group command code {}", code))
                })?;
                Payload::Cmd {
                    thread_uid,
                    rank_group,
                    cmd,
                    seq: (payload >> CMD_SEQ_SHIFT) as u16,
                }
            }
            Some(TokenType::Extended) | None => Payload::Extended {
                raw: payload as u32,
            },
        };
        Ok(Self {
            src_rank,
            dst_rank,
            payload,
        })
    }
}

impl From<RpcToken> for u64 {
    fn from(token: RpcToken) -> u64 {
        token.encode()
    }
}

impl TryFrom<u64> for RpcToken {
    type Error = VmError;

    fn try_from(bits: u64) -> VmResult<Self> {
        RpcToken::decode(bits)
    }
}

impl PartialOrd for RpcToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RpcToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.encode().cmp(&other.encode())
    }
}

impl fmt::Debug for RpcToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcToken({} {:#018x})", self, self.encode())
    }
}

impl fmt::Display for RpcToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload {
            Payload::Data { seq } => {
                write!(f, "data[{}->{} seq={}]", self.src_rank, self.dst_rank, seq)
            }
            Payload::OpTensorMeta {
                thread_uid,
                rank_group,
                seq,
            } => write!(
                f,
                "op_tensor_meta[{}->{} uid={} group={} seq={}]",
                self.src_rank, self.dst_rank, thread_uid, rank_group, seq
            ),
            Payload::Cmd {
                thread_uid,
                rank_group,
                cmd,
                seq,
            } => write!(
                f,
                "cmd[{}->{} {} uid={} group={} seq={}]",
                self.src_rank, self.dst_rank, cmd, thread_uid, rank_group, seq
            ),
            Payload::Extended { raw } => {
                write!(f, "extended[{}->{} {:#x}]", self.src_rank, self.dst_rank, raw)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
