//! Dependency-tracking instruction scheduler.
//!
//! # Two-phase dispatch
//!
//! 1. **Admit** ([`Scheduler::admit`]): validate the opcode, the target lane
//!    and every operand against the symbol table, compute read/write
//!    dependencies against earlier instructions, and append the instruction
//!    to its lane's FIFO. Rejections leave no trace.
//! 2. **Execute / retire**: a lane's head is handed to its worker once all
//!    of its producers retired. The worker runs it and calls
//!    [`Scheduler::retire`], which commits symbol lifecycle changes,
//!    releases dependents and dispatches whatever became ready.
//!
//! Dependencies form an arena of pending instructions keyed by
//! [`InstructionId`] with explicit dependent edge lists; nothing holds a
//! pointer to another instruction.
//!
//! # Failure propagation
//!
//! A failed instruction poisons the objects it writes. Dependents are never
//! executed against poisoned state: when one reaches the head of its lane it
//! resolves as [`VmError::UpstreamFailed`] naming the root failure, and its
//! own writes are poisoned in turn. Deleting a poisoned symbol still runs,
//! so ids can always be torn down.

use crate::completion::{self, CompletionHandle, Completer, InstructionOutcome};
use crate::instruction::{
    sync_cmd_for, Access, Dispatch, InstructionId, InstructionMsg, Opcode, Operand, StreamClass,
};
use crate::opcode::OpcodeTable;
use crate::stream::{LaneMap, LaneMsg};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use ranklane_core::{LogicalObjectId, ObjectScope, SymbolKind, SymbolState, VmError, VmResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters since the scheduler started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub admitted: u64,
    pub rejected: u64,
    pub retired: u64,
    pub failed: u64,
    pub upstream_failed: u64,
    pub abandoned: u64,
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SymbolRecord {
    kind: SymbolKind,
    scope: ObjectScope,
    state: SymbolState,
}

/// Admission-time view of every id's lifecycle.
#[derive(Debug, Default)]
struct SymbolTable {
    known: HashMap<LogicalObjectId, SymbolRecord>,
    retired: HashSet<LogicalObjectId>,
}

impl SymbolTable {
    fn state(&self, id: LogicalObjectId) -> SymbolState {
        self.known
            .get(&id)
            .map_or(SymbolState::Unregistered, |r| r.state)
    }

    /// The record of an id that new instructions may still reference.
    fn usable(&self, id: LogicalObjectId) -> VmResult<SymbolRecord> {
        if self.retired.contains(&id) {
            return Err(VmError::InvalidState(format!(
                "{} was deleted; ids are never reused",
                id
            )));
        }
        match self.known.get(&id) {
            None => Err(VmError::InvalidState(format!("{} is not registered", id))),
            Some(r) if r.state == SymbolState::Deleting => {
                Err(VmError::InvalidState(format!("{} is being deleted", id)))
            }
            Some(r) => Ok(*r),
        }
    }

    fn retire(&mut self, id: LogicalObjectId) {
        self.known.remove(&id);
        self.retired.insert(id);
    }
}

// ---------------------------------------------------------------------------
// Pending instructions
// ---------------------------------------------------------------------------

struct Pending {
    dispatch: Arc<Dispatch>,
    lane: usize,
    /// Producers that have not retired yet.
    blockers: usize,
    dependents: Vec<InstructionId>,
    /// Root failure this instruction inherited from a producer.
    failed_root: Option<InstructionId>,
    dispatched: bool,
    completer: Completer,
}

/// Last writer and readers-since-that-write of one object.
#[derive(Debug, Default)]
struct AccessRecord {
    last_writer: Option<InstructionId>,
    readers: Vec<InstructionId>,
}

#[derive(Default)]
struct SchedState {
    accepting: bool,
    /// Set once shutdown starts abandoning work; nothing new is dispatched.
    stopping: bool,
    pending: HashMap<InstructionId, Pending>,
    queues: Vec<VecDeque<InstructionId>>,
    objects: HashMap<LogicalObjectId, AccessRecord>,
    poisoned: HashMap<LogicalObjectId, InstructionId>,
    symbols: SymbolTable,
    /// Resolved outcomes whose completions have not been delivered yet.
    unfired: usize,
    stats: SchedulerStats,
}

type Fired = (Completer, InstructionOutcome);

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub(crate) struct Scheduler {
    state: Mutex<SchedState>,
    idle: Condvar,
    lanes: Vec<Sender<LaneMsg>>,
    lane_map: LaneMap,
    opcodes: Arc<OpcodeTable>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new(
        lane_map: LaneMap,
        opcodes: Arc<OpcodeTable>,
        lanes: Vec<Sender<LaneMsg>>,
    ) -> Self {
        let state = SchedState {
            accepting: true,
            queues: vec![VecDeque::new(); lanes.len()],
            ..SchedState::default()
        };
        Self {
            state: Mutex::new(state),
            idle: Condvar::new(),
            lanes,
            lane_map,
            opcodes,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn lane_map(&self) -> &LaneMap {
        &self.lane_map
    }

    pub(crate) fn symbol_state(&self, id: LogicalObjectId) -> SymbolState {
        self.state.lock().symbols.state(id)
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        self.state.lock().stats
    }

    /// Number of admitted instructions that have not resolved.
    pub(crate) fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    // -- admit --------------------------------------------------------------

    /// Validate and enqueue `msg`. Safe to call from any number of threads.
    pub(crate) fn admit(&self, msg: InstructionMsg) -> VmResult<CompletionHandle> {
        let InstructionMsg {
            opcode,
            operands,
            stream,
            continuation,
        } = msg;

        let mut st = self.state.lock();
        if !st.accepting {
            st.stats.rejected += 1;
            return Err(VmError::InvalidState("the VM is shutting down".into()));
        }
        let lane = match self.validate(&st, &opcode, &operands, stream) {
            Ok(lane) => lane,
            Err(e) => {
                st.stats.rejected += 1;
                debug!(opcode = opcode.name(), %stream, "rejected: {}", e);
                return Err(e);
            }
        };

        let id = InstructionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (blockers, failed_root) = Self::link(&mut st, id, &operands);

        match &opcode {
            Opcode::NewSymbol { kind, scope, .. } => {
                st.symbols.known.insert(
                    operands[0].object,
                    SymbolRecord {
                        kind: *kind,
                        scope: *scope,
                        state: SymbolState::Registering,
                    },
                );
            }
            Opcode::DeleteSymbol => {
                if let Some(r) = st.symbols.known.get_mut(&operands[0].object) {
                    r.state = SymbolState::Deleting;
                }
            }
            _ => {}
        }

        debug!(
            instruction = %id,
            opcode = opcode.name(),
            %stream,
            blockers = blockers.len(),
            "admitted"
        );
        let (completer, handle) = completion::pair(id, continuation);
        let dispatch = Arc::new(Dispatch {
            id,
            opcode,
            operands,
            stream,
        });
        for producer in &blockers {
            if let Some(p) = st.pending.get_mut(producer) {
                p.dependents.push(id);
            }
        }
        st.pending.insert(
            id,
            Pending {
                dispatch,
                lane,
                blockers: blockers.len(),
                dependents: Vec::new(),
                failed_root,
                dispatched: false,
                completer,
            },
        );
        st.queues[lane].push_back(id);
        st.stats.admitted += 1;

        let fired = self.pump(&mut st);
        drop(st);
        self.fire(fired);
        Ok(handle)
    }

    /// Record `id`'s accesses and return the pending producers it waits on,
    /// plus any root failure already recorded against its operands.
    fn link(
        st: &mut SchedState,
        id: InstructionId,
        operands: &[Operand],
    ) -> (HashSet<InstructionId>, Option<InstructionId>) {
        let SchedState {
            objects,
            pending,
            poisoned,
            ..
        } = st;
        let mut blockers = HashSet::new();
        let mut failed_root = None;
        for operand in operands {
            if failed_root.is_none() {
                failed_root = poisoned.get(&operand.object).copied();
            }
            let record = objects.entry(operand.object).or_default();
            record.readers.retain(|r| pending.contains_key(r));
            if let Some(w) = record.last_writer.filter(|w| pending.contains_key(w)) {
                blockers.insert(w);
            }
            match operand.access {
                Access::Read => record.readers.push(id),
                Access::Write => {
                    blockers.extend(record.readers.iter().copied());
                    record.readers.clear();
                    record.last_writer = Some(id);
                }
            }
        }
        (blockers, failed_root)
    }

    /// Admission checks. Returns the lane index.
    fn validate(
        &self,
        st: &SchedState,
        opcode: &Opcode,
        operands: &[Operand],
        stream: StreamClass,
    ) -> VmResult<usize> {
        let name = opcode.name();
        let lane = self.lane_map.index(stream).ok_or_else(|| {
            VmError::InvalidInstruction(format!("{}: no {} lane on this VM", name, stream))
        })?;
        let mut seen = HashSet::new();
        if !operands.iter().all(|op| seen.insert(op.object)) {
            return Err(VmError::InvalidInstruction(format!(
                "{}: an object appears twice in the operand list",
                name
            )));
        }
        if opcode.is_control() && stream != StreamClass::Control {
            return Err(VmError::InvalidInstruction(format!(
                "{} must run on the control lane, not {}",
                name, stream
            )));
        }

        let shape = |expected: &[Access]| -> VmResult<()> {
            let actual: Vec<Access> = operands.iter().map(|o| o.access).collect();
            if actual == expected {
                Ok(())
            } else {
                Err(VmError::InvalidInstruction(format!(
                    "{} expects operands {:?}, got {:?}",
                    name, expected, actual
                )))
            }
        };
        let blob = |op: &Operand| -> VmResult<SymbolRecord> {
            let record = st.symbols.usable(op.object)?;
            if record.kind != SymbolKind::Blob {
                return Err(VmError::InvalidInstruction(format!(
                    "{}: {} is a {}, not a blob",
                    name, op.object, record.kind
                )));
            }
            Ok(record)
        };

        match opcode {
            Opcode::NewSymbol {
                scope, instances, ..
            } => {
                shape(&[Access::Write])?;
                let id = operands[0].object;
                if st.symbols.retired.contains(&id) {
                    return Err(VmError::InvalidState(format!(
                        "{} was deleted; mint a fresh id",
                        id
                    )));
                }
                if st.symbols.known.contains_key(&id) {
                    return Err(VmError::InvalidState(format!("{} is already registered", id)));
                }
                let count = scope.instance_count();
                if count == 0 || (instances.len() != 1 && instances.len() != count) {
                    return Err(VmError::InvalidInstruction(format!(
                        "{} needs 1 or {} instance values, got {}",
                        id,
                        count,
                        instances.len()
                    )));
                }
            }
            Opcode::DeleteSymbol => {
                shape(&[Access::Write])?;
                st.symbols.usable(operands[0].object)?;
            }
            Opcode::SyncSymbol { .. } => {
                shape(&[Access::Read])?;
                let record = st.symbols.usable(operands[0].object)?;
                if sync_cmd_for(record.kind).is_none() {
                    return Err(VmError::InvalidInstruction(format!(
                        "{}s cannot be synchronized",
                        record.kind
                    )));
                }
            }
            Opcode::Barrier { .. } => shape(&[])?,
            Opcode::Send { peer, parallel_id } | Opcode::Recv { peer, parallel_id } => {
                if stream != StreamClass::Network(*peer) {
                    return Err(VmError::InvalidInstruction(format!(
                        "{} to rank {} must run on its network lane, not {}",
                        name, peer, stream
                    )));
                }
                let access = if matches!(opcode, Opcode::Send { .. }) {
                    Access::Read
                } else {
                    Access::Write
                };
                shape(&[access])?;
                let record = blob(&operands[0])?;
                if let ObjectScope::Mirrored { parallel_num } = record.scope {
                    if *parallel_id >= parallel_num {
                        return Err(VmError::InvalidInstruction(format!(
                            "{}: parallel index {} out of {}",
                            name, parallel_id, parallel_num
                        )));
                    }
                }
            }
            Opcode::Boxing(step) => {
                if !matches!(stream, StreamClass::Compute(_)) {
                    return Err(VmError::InvalidInstruction(format!(
                        "boxing runs on compute lanes, not {}",
                        stream
                    )));
                }
                shape(&[Access::Read, Access::Write])?;
                let src = blob(&operands[0])?;
                let dst = blob(&operands[1])?;
                if src.scope.instance_count() != step.src_parallel_num
                    || dst.scope.instance_count() != step.dst_parallel_num
                    || step.parallel_id >= step.dst_parallel_num
                {
                    return Err(VmError::InvalidInstruction(format!(
                        "boxing step {}/{} does not match blobs with {} and {} instances",
                        step.parallel_id,
                        step.dst_parallel_num,
                        src.scope.instance_count(),
                        dst.scope.instance_count()
                    )));
                }
            }
            Opcode::Kernel { name, .. } => {
                let signature = self.opcodes.signature(name).ok_or_else(|| {
                    VmError::InvalidInstruction(format!("opcode '{}' is not registered", name))
                })?;
                let kinds = operands
                    .iter()
                    .map(|op| st.symbols.usable(op.object).map(|r| r.kind))
                    .collect::<VmResult<Vec<_>>>()?;
                signature.check(name, stream, operands, &kinds)?;
            }
        }
        Ok(lane)
    }

    // -- dispatch / retire --------------------------------------------------

    /// Hand every ready lane head to its worker and resolve heads that
    /// inherited an upstream failure. Loops until nothing changes, since
    /// resolving one head can unblock another lane.
    fn pump(&self, st: &mut SchedState) -> Vec<Fired> {
        let mut fired = Vec::new();
        if st.stopping {
            return fired;
        }
        loop {
            let mut progressed = false;
            for lane in 0..st.queues.len() {
                while let Some(&head) = st.queues[lane].front() {
                    let Some(entry) = st.pending.get_mut(&head) else {
                        st.queues[lane].pop_front();
                        continue;
                    };
                    if entry.dispatched || entry.blockers > 0 {
                        break;
                    }
                    let tolerant = matches!(entry.dispatch.opcode, Opcode::DeleteSymbol);
                    if let Some(root) = entry.failed_root.filter(|_| !tolerant) {
                        st.queues[lane].pop_front();
                        let err = VmError::UpstreamFailed {
                            instruction: head.as_u64(),
                            root: root.as_u64(),
                        };
                        warn!(instruction = %head, root = %root, "not run: upstream failed");
                        fired.extend(self.finish(st, head, Err(err)));
                        progressed = true;
                        continue;
                    }
                    entry.dispatched = true;
                    let dispatch = Arc::clone(&entry.dispatch);
                    debug!(instruction = %head, lane = %dispatch.stream, "dispatched");
                    if self.lanes[lane].send(LaneMsg::Run(dispatch)).is_err() {
                        st.queues[lane].pop_front();
                        fired.extend(self.finish(st, head, Err(VmError::Abandoned(head.as_u64()))));
                        progressed = true;
                        continue;
                    }
                    break;
                }
            }
            if !progressed {
                return fired;
            }
        }
    }

    /// Called by a lane worker after running `dispatch`.
    pub(crate) fn retire(&self, dispatch: &Dispatch, outcome: InstructionOutcome) {
        let mut st = self.state.lock();
        let Some(lane) = st.pending.get(&dispatch.id).map(|p| p.lane) else {
            return;
        };
        if st.queues[lane].front() == Some(&dispatch.id) {
            st.queues[lane].pop_front();
        } else {
            st.queues[lane].retain(|id| *id != dispatch.id);
        }
        if let Err(e) = &outcome {
            warn!(instruction = %dispatch.id, opcode = dispatch.opcode.name(), "failed: {}", e);
        } else {
            debug!(instruction = %dispatch.id, "retired");
        }
        let mut fired: Vec<Fired> =
            self.finish(&mut st, dispatch.id, outcome).into_iter().collect();
        fired.extend(self.pump(&mut st));
        drop(st);
        self.fire(fired);
    }

    /// Resolve `id`: commit lifecycle effects, poison on failure, release
    /// dependents. The caller must already have removed it from its queue.
    fn finish(
        &self,
        st: &mut SchedState,
        id: InstructionId,
        outcome: InstructionOutcome,
    ) -> Option<Fired> {
        let entry = st.pending.remove(&id)?;
        let dispatch = &entry.dispatch;
        let root = match &outcome {
            // Abandoned work never ran, so there is nothing to poison.
            Ok(()) | Err(VmError::Abandoned(_)) => None,
            Err(VmError::UpstreamFailed { root, .. }) => Some(InstructionId(*root)),
            Err(_) => Some(id),
        };

        match &outcome {
            Ok(()) => st.stats.retired += 1,
            Err(VmError::UpstreamFailed { .. }) => st.stats.upstream_failed += 1,
            Err(VmError::Abandoned(_)) => st.stats.abandoned += 1,
            Err(_) => st.stats.failed += 1,
        }

        match (&dispatch.opcode, &outcome) {
            (Opcode::NewSymbol { kind, .. }, Ok(())) => {
                let object = dispatch.operands[0].object;
                if let Some(r) = st.symbols.known.get_mut(&object) {
                    r.state = SymbolState::Live;
                }
                info!(%object, %kind, "symbol live");
            }
            (Opcode::NewSymbol { .. }, Err(_)) | (Opcode::DeleteSymbol, _) => {
                let object = dispatch.operands[0].object;
                st.symbols.retire(object);
                st.poisoned.remove(&object);
                st.objects.remove(&object);
                if outcome.is_ok() {
                    info!(%object, "symbol deleted");
                }
            }
            _ => {}
        }

        if let Some(root) = root {
            if !matches!(dispatch.opcode, Opcode::DeleteSymbol) {
                for operand in dispatch.operands.iter().filter(|o| o.is_write()) {
                    if !st.symbols.retired.contains(&operand.object) {
                        st.poisoned.insert(operand.object, root);
                    }
                }
            }
        }

        for dependent in &entry.dependents {
            if let Some(d) = st.pending.get_mut(dependent) {
                d.blockers = d.blockers.saturating_sub(1);
                if let Some(root) = root {
                    d.failed_root.get_or_insert(root);
                }
            }
        }

        st.unfired += 1;
        Some((entry.completer, outcome))
    }

    /// Deliver outcomes outside the state lock.
    fn fire(&self, fired: Vec<Fired>) {
        if fired.is_empty() {
            return;
        }
        let count = fired.len();
        for (completer, outcome) in fired {
            completer.complete(outcome);
        }
        let mut st = self.state.lock();
        st.unfired -= count;
        if st.pending.is_empty() && st.unfired == 0 {
            self.idle.notify_all();
        }
    }

    // -- idle / shutdown ----------------------------------------------------

    /// Block until every admitted instruction has resolved and its
    /// completion was delivered. Returns `false` on timeout.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        while !(st.pending.is_empty() && st.unfired == 0) {
            if self.idle.wait_until(&mut st, deadline).timed_out() {
                return st.pending.is_empty() && st.unfired == 0;
            }
        }
        true
    }

    /// Stop admitting, give in-flight work `grace` to finish, resolve
    /// everything that never started, then tell every lane to stop.
    /// Returns the number of instructions that did not run.
    pub(crate) fn shutdown(&self, grace: Duration) -> usize {
        self.state.lock().accepting = false;
        let drained = self.wait_idle(grace);

        let mut st = self.state.lock();
        st.stopping = true;
        let mut leftovers: Vec<InstructionId> = st
            .pending
            .iter()
            .filter(|(_, p)| !p.dispatched)
            .map(|(id, _)| *id)
            .collect();
        leftovers.sort_unstable();
        let mut fired = Vec::with_capacity(leftovers.len());
        for id in &leftovers {
            let Some(lane) = st.pending.get(id).map(|p| p.lane) else {
                continue;
            };
            st.queues[lane].retain(|q| q != id);
            let err = match st.pending.get(id).and_then(|p| p.failed_root) {
                Some(root) => VmError::UpstreamFailed {
                    instruction: id.as_u64(),
                    root: root.as_u64(),
                },
                None => VmError::Abandoned(id.as_u64()),
            };
            fired.extend(self.finish(&mut st, *id, Err(err)));
        }
        drop(st);
        self.fire(fired);

        for lane in &self.lanes {
            let _ = lane.send(LaneMsg::Stop);
        }
        if !drained {
            warn!(abandoned = leftovers.len(), "shutdown grace period expired");
        }
        leftovers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{lane_channels, LaneExecutor, LanePool};
    use ranklane_core::IdMinter;
    use serde_json::Value;
    use std::sync::mpsc;

    /// Records execution order; fails any kernel named "fail" and parks any
    /// kernel named "gate" until released.
    struct Recorder {
        log: parking_lot::Mutex<Vec<InstructionId>>,
        gate: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl LaneExecutor for Recorder {
        fn execute(&self, _lane: StreamClass, d: &Dispatch) -> VmResult<()> {
            if let Opcode::Kernel { name, .. } = &d.opcode {
                if name == "gate" {
                    let parked = self.gate.lock().take();
                    if let Some(rx) = parked {
                        let _ = rx.recv();
                    }
                }
                if name == "fail" {
                    return Err(VmError::ExecutionFailed("injected".into()));
                }
            }
            self.log.lock().push(d.id);
            Ok(())
        }
    }

    struct Harness {
        sched: Arc<Scheduler>,
        pool: Option<LanePool>,
        exec: Arc<Recorder>,
        gate: Option<mpsc::Sender<()>>,
    }

    impl Harness {
        fn new(compute: usize) -> Self {
            use crate::opcode::{kernel_fn, KernelSignature, OperandSpec};
            let opcodes = Arc::new(OpcodeTable::new());
            for name in ["touch", "fail", "gate"] {
                opcodes
                    .register(
                        name,
                        KernelSignature::compute(vec![OperandSpec::write(SymbolKind::Blob)]),
                        kernel_fn(|_| Ok(())),
                    )
                    .unwrap();
            }
            opcodes
                .register(
                    "peek",
                    KernelSignature::compute(vec![OperandSpec::read(SymbolKind::Blob)]),
                    kernel_fn(|_| Ok(())),
                )
                .unwrap();
            let map = LaneMap::new(compute, Vec::new());
            let (tx, rx) = lane_channels(map.len());
            let sched = Arc::new(Scheduler::new(map.clone(), opcodes, tx));
            let (gate_tx, gate_rx) = mpsc::channel();
            let exec = Arc::new(Recorder {
                log: parking_lot::Mutex::new(Vec::new()),
                gate: parking_lot::Mutex::new(Some(gate_rx)),
            });
            let pool = LanePool::spawn(&map, rx, Arc::clone(&sched), exec.clone()).unwrap();
            Self {
                sched,
                pool: Some(pool),
                exec,
                gate: Some(gate_tx),
            }
        }

        fn blob(&self, minter: &IdMinter) -> LogicalObjectId {
            let id = minter.mint();
            self.sched
                .admit(InstructionMsg::new_symbol(
                    id,
                    SymbolKind::Blob,
                    ObjectScope::Consistent,
                    vec![Value::Null],
                ))
                .unwrap();
            id
        }

        fn kernel(&self, name: &str, lane: u16, op: Operand) -> VmResult<CompletionHandle> {
            self.sched.admit(InstructionMsg::kernel(
                name,
                StreamClass::Compute(lane),
                vec![op],
                Value::Null,
            ))
        }

        fn open_gate(&mut self) {
            if let Some(tx) = self.gate.take() {
                let _ = tx.send(());
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.open_gate();
            self.sched.shutdown(Duration::from_secs(5));
            if let Some(pool) = self.pool.take() {
                pool.join();
            }
        }
    }

    #[test]
    fn producer_retires_before_consumer_across_lanes() {
        let h = Harness::new(2);
        let minter = IdMinter::new();
        let a = h.blob(&minter);
        let w = h.kernel("touch", 0, Operand::write(a)).unwrap();
        let r = h.kernel("peek", 1, Operand::read(a)).unwrap();
        let (wid, rid) = (w.id(), r.id());
        assert_eq!(r.wait(), Ok(()));
        assert_eq!(w.wait(), Ok(()));
        let log = h.exec.log.lock().clone();
        let pos = |id| log.iter().position(|x| *x == id).unwrap();
        assert!(pos(wid) < pos(rid));
    }

    #[test]
    fn use_before_ready_is_rejected_or_waits() {
        let h = Harness::new(1);
        let minter = IdMinter::new();
        let unknown = minter.mint();
        assert!(matches!(
            h.kernel("peek", 0, Operand::read(unknown)),
            Err(VmError::InvalidState(_))
        ));
        // Registering ids are admitted but wait for the registration.
        let a = h.blob(&minter);
        let handle = h.kernel("peek", 0, Operand::read(a)).unwrap();
        assert_eq!(handle.wait(), Ok(()));
        assert_eq!(h.sched.symbol_state(a), SymbolState::Live);
        assert_eq!(h.sched.stats().rejected, 1);
    }

    #[test]
    fn deleted_ids_are_never_reused() {
        let h = Harness::new(1);
        let minter = IdMinter::new();
        let a = h.blob(&minter);
        h.sched
            .admit(InstructionMsg::delete_symbol(a))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(h.sched.symbol_state(a), SymbolState::Unregistered);
        let again = h.sched.admit(InstructionMsg::new_symbol(
            a,
            SymbolKind::Blob,
            ObjectScope::Consistent,
            vec![Value::Null],
        ));
        assert!(matches!(again, Err(VmError::InvalidState(_))));
        assert!(matches!(
            h.kernel("peek", 0, Operand::read(a)),
            Err(VmError::InvalidState(_))
        ));
    }

    #[test]
    fn deleting_blocks_new_uses_but_not_earlier_ones() {
        let mut h = Harness::new(1);
        let minter = IdMinter::new();
        let a = h.blob(&minter);
        let b = h.blob(&minter);
        // Park the compute lane so the reader of `a` is still in flight.
        let gate = h.kernel("gate", 0, Operand::write(b)).unwrap();
        let reader = h.kernel("peek", 0, Operand::read(a)).unwrap();
        let delete = h.sched.admit(InstructionMsg::delete_symbol(a)).unwrap();
        assert_eq!(h.sched.symbol_state(a), SymbolState::Deleting);
        assert!(matches!(
            h.kernel("peek", 0, Operand::read(a)),
            Err(VmError::InvalidState(_))
        ));
        h.open_gate();
        assert_eq!(gate.wait(), Ok(()));
        assert_eq!(reader.wait(), Ok(()));
        assert_eq!(delete.wait(), Ok(()));
    }

    #[test]
    fn failure_poisons_dependents_only() {
        let h = Harness::new(2);
        let minter = IdMinter::new();
        let a = h.blob(&minter);
        let b = h.blob(&minter);
        let bad = h.kernel("fail", 0, Operand::write(a)).unwrap();
        let bad_id = bad.id();
        let child = h.kernel("touch", 0, Operand::write(a)).unwrap();
        let grandchild = h.kernel("peek", 1, Operand::read(a)).unwrap();
        let sibling = h.kernel("touch", 1, Operand::write(b)).unwrap();

        assert_eq!(bad.wait(), Err(VmError::ExecutionFailed("injected".into())));
        for handle in [child, grandchild] {
            let id = handle.id().as_u64();
            assert_eq!(
                handle.wait(),
                Err(VmError::UpstreamFailed {
                    instruction: id,
                    root: bad_id.as_u64()
                })
            );
        }
        assert_eq!(sibling.wait(), Ok(()));

        // Later readers of the poisoned object are not run either.
        let late = h.kernel("peek", 0, Operand::read(a)).unwrap();
        assert!(matches!(late.wait(), Err(VmError::UpstreamFailed { .. })));

        // But the object can still be deleted.
        let delete = h.sched.admit(InstructionMsg::delete_symbol(a)).unwrap();
        assert_eq!(delete.wait(), Ok(()));

        assert!(h.sched.wait_idle(Duration::from_secs(5)));
        let stats = h.sched.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.upstream_failed, 3);
    }

    #[test]
    fn malformed_instructions_fail_at_admit() {
        let h = Harness::new(1);
        let minter = IdMinter::new();
        let a = h.blob(&minter);
        // Unregistered opcode.
        assert!(matches!(
            h.kernel("nope", 0, Operand::read(a)),
            Err(VmError::InvalidInstruction(_))
        ));
        // Wrong access for the signature.
        assert!(matches!(
            h.kernel("peek", 0, Operand::write(a)),
            Err(VmError::InvalidInstruction(_))
        ));
        // Missing lane.
        assert!(matches!(
            h.kernel("peek", 3, Operand::read(a)),
            Err(VmError::InvalidInstruction(_))
        ));
        // Control opcode on a data lane.
        let mut msg = InstructionMsg::delete_symbol(a);
        msg.stream = StreamClass::Compute(0);
        assert!(matches!(h.sched.admit(msg), Err(VmError::InvalidInstruction(_))));
        // Blobs have no sync command.
        let group = ranklane_core::RankGroupTable::new().register([0]).unwrap();
        assert!(matches!(
            h.sched.admit(InstructionMsg::sync_symbol(a, group.id)),
            Err(VmError::InvalidInstruction(_))
        ));
        assert_eq!(h.sched.stats().rejected, 5);
        assert!(h.sched.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn shutdown_abandons_work_that_never_started() {
        let mut h = Harness::new(1);
        let minter = IdMinter::new();
        let a = h.blob(&minter);
        let gate = h.kernel("gate", 0, Operand::write(a)).unwrap();
        let first = h.kernel("touch", 0, Operand::write(a)).unwrap();
        let second = h.kernel("touch", 0, Operand::write(a)).unwrap();
        let (first_id, second_id) = (first.id().as_u64(), second.id().as_u64());

        let sched = Arc::clone(&h.sched);
        let stopper = std::thread::spawn(move || sched.shutdown(Duration::from_millis(50)));
        let abandoned = stopper.join().unwrap();
        h.open_gate();

        // A chain that never started is abandoned link by link, not
        // reported as a failure of its first link.
        assert_eq!(abandoned, 2);
        assert_eq!(first.wait(), Err(VmError::Abandoned(first_id)));
        assert_eq!(second.wait(), Err(VmError::Abandoned(second_id)));
        assert_eq!(gate.wait(), Ok(()));
        let stats = h.sched.stats();
        assert_eq!(stats.abandoned, 2);
        assert_eq!(stats.upstream_failed, 0);
        assert_eq!(stats.failed, 0);
        assert!(matches!(
            h.kernel("touch", 0, Operand::write(a)),
            Err(VmError::InvalidState(_))
        ));
    }
}
