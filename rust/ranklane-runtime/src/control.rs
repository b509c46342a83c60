//! Control-lane side effects: symbol lifecycle and rank-group commands.
//!
//! Everything here runs on the single control lane thread, which binds a
//! thread-consistent uid when it starts. Every rank's control lane binds
//! first in a fresh pool, so the uid matches across ranks and a token built
//! on one rank addresses the same channel on its peers.
//!
//! Consistent tensor metas are checked under `OpTensorMeta` tokens; every
//! other symbol sync and the barrier travel under `Cmd` tokens.

use crate::instruction::sync_cmd_for;
use crate::registry::{ObjectEntry, ObjectRegistry};
use crate::rpc::Transport;
use parking_lot::Mutex;
use ranklane_core::{
    LogicalObjectId, ObjectScope, RankGroup, RankGroupCmd, RankGroupId, RankGroupTable,
    RpcToken, SymbolKind, ThreadUidPool, TokenFactory, VmError, VmResult,
};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Stable fingerprint of a registered object: kind, scope and every
/// instance value, canonically serialized.
pub fn fingerprint(entry: &ObjectEntry) -> VmResult<String> {
    #[derive(Serialize)]
    struct Canonical<'a> {
        kind: SymbolKind,
        scope: ObjectScope,
        instances: &'a [Value],
    }
    let instances = entry.snapshot();
    let canonical = Canonical {
        kind: entry.kind(),
        scope: entry.scope(),
        instances: &instances,
    };
    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| VmError::ExecutionFailed(format!("cannot serialize {}: {}", entry.id(), e)))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub(crate) struct ControlUnit {
    rank: u16,
    registry: Arc<ObjectRegistry>,
    groups: Arc<RankGroupTable>,
    uids: Arc<ThreadUidPool>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    /// Next sequence number per (command, rank group, peer).
    seqs: Mutex<HashMap<(RankGroupCmd, RankGroupId, u16), u32>>,
}

impl ControlUnit {
    pub(crate) fn new(
        registry: Arc<ObjectRegistry>,
        groups: Arc<RankGroupTable>,
        uids: Arc<ThreadUidPool>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Self {
        Self {
            rank: transport.rank(),
            registry,
            groups,
            uids,
            transport,
            timeout,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the control lane's uid. Called once on the lane thread.
    pub(crate) fn bind_thread(&self) -> VmResult<u8> {
        let uid = self.uids.bind_current_thread()?;
        debug!(rank = self.rank, uid, "control lane bound");
        Ok(uid)
    }

    pub(crate) fn new_symbol(
        &self,
        id: LogicalObjectId,
        kind: SymbolKind,
        scope: ObjectScope,
        instances: &[Value],
    ) -> VmResult<()> {
        self.registry.insert(id, kind, scope, instances.to_vec())?;
        Ok(())
    }

    pub(crate) fn delete_symbol(&self, id: LogicalObjectId) {
        // A failed registration leaves nothing behind to remove.
        if self.registry.remove(id).is_none() {
            debug!(object = %id, "delete of an object that never materialized");
        }
    }

    /// Agree with every peer in `group` on the content of `id`.
    pub(crate) fn sync_symbol(&self, id: LogicalObjectId, group: RankGroupId) -> VmResult<()> {
        let entry = self.registry.resolve(id)?;
        let cmd = sync_cmd_for(entry.kind()).ok_or_else(|| {
            VmError::InvalidInstruction(format!("{}s cannot be synchronized", entry.kind()))
        })?;
        let local = fingerprint(&entry)?;
        let group = self.group(group)?;
        let replies = self.exchange(cmd, &group, local.as_bytes())?;
        for (peer, reply) in replies {
            if reply != local.as_bytes() {
                return Err(VmError::ExecutionFailed(format!(
                    "{} differs between rank {} and rank {}",
                    id, self.rank, peer
                )));
            }
        }
        info!(object = %id, %cmd, group = %group.id, "symbol synchronized");
        Ok(())
    }

    /// Returns once every member of `group` reached the same barrier.
    pub(crate) fn barrier(&self, group: RankGroupId) -> VmResult<()> {
        let group = self.group(group)?;
        self.exchange(RankGroupCmd::Barrier, &group, &[])?;
        debug!(group = %group.id, "barrier passed");
        Ok(())
    }

    fn group(&self, id: RankGroupId) -> VmResult<RankGroup> {
        let group = self
            .groups
            .get(id)
            .ok_or_else(|| VmError::InvalidInstruction(format!("{} is not registered", id)))?;
        if !group.contains(self.rank) {
            return Err(VmError::InvalidInstruction(format!(
                "rank {} is not a member of {}",
                self.rank, id
            )));
        }
        Ok(group)
    }

    fn token(
        factory: &TokenFactory,
        cmd: RankGroupCmd,
        src: u16,
        dst: u16,
    ) -> VmResult<RpcToken> {
        match cmd {
            RankGroupCmd::SyncSymbolConsistentTensorMeta => {
                factory.new_op_tensor_meta_token(src, dst)
            }
            _ => factory.new_cmd_token(cmd, src, dst),
        }
    }

    /// Position `token` at the channel's current sequence number and advance
    /// it, wrapping at the token's field width.
    fn sequenced(
        &self,
        token: RpcToken,
        key: (RankGroupCmd, RankGroupId, u16),
    ) -> VmResult<RpcToken> {
        let mut seqs = self.seqs.lock();
        let slot = seqs.entry(key).or_insert(0);
        let token = token.with_sequence(*slot)?;
        *slot = token.next().sequence();
        Ok(token)
    }

    /// Send `payload` to every peer, then collect each peer's payload.
    fn exchange(
        &self,
        cmd: RankGroupCmd,
        group: &RankGroup,
        payload: &[u8],
    ) -> VmResult<Vec<(u16, Vec<u8>)>> {
        let factory = TokenFactory::new(Arc::clone(&self.uids), group.clone());
        let mut inbound = Vec::new();
        for peer in group.peers_of(self.rank) {
            let key = (cmd, group.id, peer);
            let out = self.sequenced(Self::token(&factory, cmd, self.rank, peer)?, key)?;
            let back = Self::token(&factory, cmd, peer, self.rank)?.with_sequence(out.sequence())?;
            self.transport.send(out, payload.to_vec())?;
            inbound.push((peer, back));
        }
        let mut replies = Vec::with_capacity(inbound.len());
        for (peer, token) in inbound {
            replies.push((peer, self.transport.recv(token, self.timeout)?));
        }
        Ok(replies)
    }
}

impl fmt::Debug for ControlUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlUnit")
            .field("rank", &self.rank)
            .field("objects", &self.registry.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LoopbackHub;
    use ranklane_core::IdMinter;
    use serde_json::json;
    use std::thread;

    fn unit(hub: &Arc<LoopbackHub>, rank: u16, groups: &Arc<RankGroupTable>) -> ControlUnit {
        ControlUnit::new(
            Arc::new(ObjectRegistry::new()),
            Arc::clone(groups),
            Arc::new(ThreadUidPool::new()),
            Arc::new(hub.endpoint(rank).unwrap()),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn fingerprint_ignores_id_but_not_content() {
        let minter = IdMinter::new();
        let registry = ObjectRegistry::new();
        let a = registry
            .insert(
                minter.mint(),
                SymbolKind::Distribution,
                ObjectScope::Consistent,
                vec![json!("S(0)")],
            )
            .unwrap();
        let b = registry
            .insert(
                minter.mint(),
                SymbolKind::Distribution,
                ObjectScope::Consistent,
                vec![json!("S(0)")],
            )
            .unwrap();
        let c = registry
            .insert(
                minter.mint(),
                SymbolKind::Distribution,
                ObjectScope::Consistent,
                vec![json!("B")],
            )
            .unwrap();
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&c).unwrap());
        assert_eq!(fingerprint(&a).unwrap().len(), 64);
    }

    #[test]
    fn two_ranks_sync_and_detect_mismatch() {
        let hub = LoopbackHub::new(2);
        let groups = Arc::new(RankGroupTable::new());
        let world = groups.register([0, 1]).unwrap();

        let workers: Vec<_> = (0..2u16)
            .map(|rank| {
                let cu = unit(&hub, rank, &groups);
                let group = world.id;
                thread::spawn(move || {
                    cu.bind_thread().unwrap();
                    let minter = IdMinter::new();
                    let same = minter.mint();
                    cu.new_symbol(
                        same,
                        SymbolKind::ParallelDesc,
                        ObjectScope::Consistent,
                        &[json!([0, 1])],
                    )
                    .unwrap();
                    let first = cu.sync_symbol(same, group);

                    let differs = minter.mint();
                    cu.new_symbol(
                        differs,
                        SymbolKind::ParallelDesc,
                        ObjectScope::Consistent,
                        &[json!(rank)],
                    )
                    .unwrap();
                    let second = cu.sync_symbol(differs, group);
                    let third = cu.barrier(group);
                    (first, second, third)
                })
            })
            .collect();

        for worker in workers {
            let (first, second, third) = worker.join().unwrap();
            assert_eq!(first, Ok(()));
            assert!(matches!(second, Err(VmError::ExecutionFailed(_))));
            assert_eq!(third, Ok(()));
        }
        assert_eq!(hub.in_flight(), 0);
    }

    /// Loopback endpoint that remembers the type of every token it sends.
    struct Tap {
        inner: crate::rpc::LoopbackTransport,
        sent: Mutex<Vec<ranklane_core::TokenType>>,
    }

    impl Transport for Tap {
        fn rank(&self) -> u16 {
            self.inner.rank()
        }

        fn send(
            &self,
            token: RpcToken,
            payload: Vec<u8>,
        ) -> Result<(), crate::rpc::TransportError> {
            self.sent.lock().push(token.token_type());
            self.inner.send(token, payload)
        }

        fn recv(
            &self,
            token: RpcToken,
            timeout: Duration,
        ) -> Result<Vec<u8>, crate::rpc::TransportError> {
            self.inner.recv(token, timeout)
        }
    }

    #[test]
    fn tensor_metas_sync_under_meta_tokens() {
        use ranklane_core::TokenType;

        let hub = LoopbackHub::new(2);
        let groups = Arc::new(RankGroupTable::new());
        let world = groups.register([0, 1]).unwrap();

        let workers: Vec<_> = (0..2u16)
            .map(|rank| {
                let tap = Arc::new(Tap {
                    inner: hub.endpoint(rank).unwrap(),
                    sent: Mutex::new(Vec::new()),
                });
                let cu = ControlUnit::new(
                    Arc::new(ObjectRegistry::new()),
                    Arc::clone(&groups),
                    Arc::new(ThreadUidPool::new()),
                    tap.clone(),
                    Duration::from_secs(5),
                );
                let group = world.id;
                thread::spawn(move || {
                    cu.bind_thread().unwrap();
                    let minter = IdMinter::new();
                    let mut outcomes = Vec::new();
                    for shape in [json!([2, 3]), json!([2, 3]), json!([rank, 3])] {
                        let id = minter.mint();
                        cu.new_symbol(
                            id,
                            SymbolKind::ConsistentTensorMeta,
                            ObjectScope::Consistent,
                            &[json!({ "shape": shape, "dtype": "f32" })],
                        )
                        .unwrap();
                        outcomes.push(cu.sync_symbol(id, group));
                    }
                    outcomes.push(cu.barrier(group));
                    let sent = tap.sent.lock().clone();
                    (outcomes, sent)
                })
            })
            .collect();

        for worker in workers {
            let (outcomes, sent) = worker.join().unwrap();
            assert_eq!(outcomes[0], Ok(()));
            assert_eq!(outcomes[1], Ok(()));
            assert!(matches!(outcomes[2], Err(VmError::ExecutionFailed(_))));
            assert_eq!(outcomes[3], Ok(()));
            assert_eq!(
                sent,
                vec![
                    TokenType::OpTensorMeta,
                    TokenType::OpTensorMeta,
                    TokenType::OpTensorMeta,
                    TokenType::Cmd,
                ]
            );
        }
        assert_eq!(hub.in_flight(), 0);
    }

    #[test]
    fn non_members_and_blobs_are_refused() {
        let hub = LoopbackHub::new(3);
        let groups = Arc::new(RankGroupTable::new());
        let pair = groups.register([1, 2]).unwrap();
        let cu = unit(&hub, 0, &groups);
        cu.bind_thread().unwrap();
        assert!(matches!(cu.barrier(pair.id), Err(VmError::InvalidInstruction(_))));

        let id = IdMinter::new().mint();
        cu.new_symbol(id, SymbolKind::Blob, ObjectScope::Consistent, &[Value::Null])
            .unwrap();
        let solo = groups.register([0]).unwrap();
        assert!(matches!(
            cu.sync_symbol(id, solo.id),
            Err(VmError::InvalidInstruction(_))
        ));
        cu.delete_symbol(id);
        cu.delete_symbol(id);
        assert!(cu.registry.is_empty());
    }
}
