//! Bounded coordination-id pools used to mint meta and command tokens.
//!
//! Two small id spaces are packed into every `OpTensorMeta` / `Cmd` token:
//! the thread-consistent unique id (which producer thread opened the
//! channel) and the rank-group id (which set of ranks takes part). Both are
//! 3-bit fields, so both pools hold at most eight entries and report
//! [`VmError::ResourceExhausted`] when full.
//!
//! The pools are ordinary values owned by whoever builds the VM context;
//! there is no process-global table.

use crate::error::{VmError, VmResult};
use crate::token::{RankGroupCmd, RpcToken, MAX_RANK_GROUPS, MAX_THREAD_CONSISTENT_UIDS};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

// ---------------------------------------------------------------------------
// ThreadUidPool
// ---------------------------------------------------------------------------

struct UidSlots {
    owners: [Option<ThreadId>; MAX_THREAD_CONSISTENT_UIDS],
    /// Next slot to try; advances mod 8 after every allocation.
    cursor: usize,
}

/// Assigns each producer thread one of eight thread-consistent unique ids.
///
/// A thread keeps its id until it calls
/// [`release_current_thread`](ThreadUidPool::release_current_thread), so at
/// most eight coordination channels per pool are in flight at once.
pub struct ThreadUidPool {
    slots: Mutex<UidSlots>,
}

impl Default for ThreadUidPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadUidPool {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(UidSlots {
                owners: [None; MAX_THREAD_CONSISTENT_UIDS],
                cursor: 0,
            }),
        }
    }

    /// Return the calling thread's uid, claiming a free slot on first use.
    pub fn bind_current_thread(&self) -> VmResult<u8> {
        let me = thread::current().id();
        let mut slots = self.slots.lock();
        if let Some(uid) = slots.owners.iter().position(|o| *o == Some(me)) {
            return Ok(uid as u8);
        }
        let start = slots.cursor;
        for offset in 0..MAX_THREAD_CONSISTENT_UIDS {
            let idx = (start + offset) % MAX_THREAD_CONSISTENT_UIDS;
            if slots.owners[idx].is_none() {
                slots.owners[idx] = Some(me);
                slots.cursor = (idx + 1) % MAX_THREAD_CONSISTENT_UIDS;
                return Ok(idx as u8);
            }
        }
        Err(VmError::ResourceExhausted(format!(
            "all {} thread consistent unique ids are bound",
            MAX_THREAD_CONSISTENT_UIDS
        )))
    }

    /// The calling thread's uid, if it holds one.
    pub fn current(&self) -> Option<u8> {
        let me = thread::current().id();
        self.slots
            .lock()
            .owners
            .iter()
            .position(|o| *o == Some(me))
            .map(|uid| uid as u8)
    }

    /// Free the calling thread's slot. Returns `false` if it held none.
    pub fn release_current_thread(&self) -> bool {
        let me = thread::current().id();
        let mut slots = self.slots.lock();
        match slots.owners.iter().position(|o| *o == Some(me)) {
            Some(idx) => {
                slots.owners[idx] = None;
                true
            }
            None => false,
        }
    }

    /// Number of bound slots.
    pub fn in_use(&self) -> usize {
        self.slots.lock().owners.iter().filter(|o| o.is_some()).count()
    }
}

impl fmt::Debug for ThreadUidPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadUidPool")
            .field("in_use", &self.in_use())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RankGroupTable
// ---------------------------------------------------------------------------

/// 3-bit identifier of a registered rank group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RankGroupId(u8);

impl RankGroupId {
    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for RankGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group:{}", self.0)
    }
}

/// A registered set of ranks, sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankGroup {
    pub id: RankGroupId,
    pub ranks: Vec<u16>,
}

impl RankGroup {
    pub fn contains(&self, rank: u16) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }

    /// Every member except `rank`.
    pub fn peers_of(&self, rank: u16) -> impl Iterator<Item = u16> + '_ {
        self.ranks.iter().copied().filter(move |r| *r != rank)
    }
}

/// Registry of rank groups. Registering an identical set twice yields the
/// same id.
#[derive(Debug, Default)]
pub struct RankGroupTable {
    groups: Mutex<Vec<Vec<u16>>>,
}

impl RankGroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I>(&self, ranks: I) -> VmResult<RankGroup>
    where
        I: IntoIterator<Item = u16>,
    {
        let mut ranks: Vec<u16> = ranks.into_iter().collect();
        ranks.sort_unstable();
        ranks.dedup();
        if ranks.is_empty() {
            return Err(VmError::InvalidState("rank group must not be empty".into()));
        }

        let mut groups = self.groups.lock();
        if let Some(idx) = groups.iter().position(|g| *g == ranks) {
            return Ok(RankGroup {
                id: RankGroupId(idx as u8),
                ranks,
            });
        }
        if groups.len() >= MAX_RANK_GROUPS {
            return Err(VmError::ResourceExhausted(format!(
                "all {} rank group ids are registered",
                MAX_RANK_GROUPS
            )));
        }
        groups.push(ranks.clone());
        Ok(RankGroup {
            id: RankGroupId((groups.len() - 1) as u8),
            ranks,
        })
    }

    pub fn get(&self, id: RankGroupId) -> Option<RankGroup> {
        self.groups.lock().get(id.0 as usize).map(|ranks| RankGroup {
            id,
            ranks: ranks.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// TokenFactory
// ---------------------------------------------------------------------------

/// Mints `OpTensorMeta` and `Cmd` tokens for one rank group, stamping the
/// calling thread's uid into each.
#[derive(Debug, Clone)]
pub struct TokenFactory {
    uids: Arc<ThreadUidPool>,
    group: RankGroup,
}

impl TokenFactory {
    pub fn new(uids: Arc<ThreadUidPool>, group: RankGroup) -> Self {
        Self { uids, group }
    }

    pub fn group(&self) -> &RankGroup {
        &self.group
    }

    fn check_members(&self, src: u16, dst: u16) -> VmResult<()> {
        for rank in [src, dst] {
            if !self.group.contains(rank) {
                return Err(VmError::InvalidState(format!(
                    "rank {} is not a member of {}",
                    rank, self.group.id
                )));
            }
        }
        Ok(())
    }

    pub fn new_op_tensor_meta_token(&self, src: u16, dst: u16) -> VmResult<RpcToken> {
        self.check_members(src, dst)?;
        let uid = self.uids.bind_current_thread()?;
        RpcToken::new_op_tensor_meta(src, dst, uid, self.group.id.as_u8())
    }

    pub fn new_cmd_token(&self, cmd: RankGroupCmd, src: u16, dst: u16) -> VmResult<RpcToken> {
        self.check_members(src, dst)?;
        let uid = self.uids.bind_current_thread()?;
        RpcToken::new_cmd(src, dst, cmd, uid, self.group.id.as_u8())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
