//! The per-rank virtual machine: lanes, scheduler, registry and transport
//! wired together behind a submit/complete API.

use crate::boxing::{BoxingDispatcher, BoxingKernel, BoxingRequest, RowBoxingKernel};
use crate::completion::CompletionHandle;
use crate::config::VmConfig;
use crate::control::ControlUnit;
use crate::instruction::{Dispatch, InstructionMsg, Opcode, StreamClass};
use crate::opcode::{InstructionKernel, KernelContext, KernelSignature, OpcodeTable};
use crate::registry::ObjectRegistry;
use crate::rpc::{DataChannels, LoopbackHub, Transport};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::stream::{lane_channels, LaneExecutor, LaneMap, LanePool};
use parking_lot::Mutex;
use ranklane_core::{
    IdMinter, LogicalObjectId, ObjectScope, RankGroup, RankGroupTable, SymbolKind, SymbolState,
    ThreadUidPool, TokenFactory, VmError, VmResult,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Lane executor
// ---------------------------------------------------------------------------

/// Side effects of every opcode, run on the lane that owns the instruction.
struct VmExecutor {
    rank: u16,
    control: ControlUnit,
    registry: Arc<ObjectRegistry>,
    opcodes: Arc<OpcodeTable>,
    boxing: Arc<dyn BoxingKernel>,
    transport: Arc<dyn Transport>,
    data: DataChannels,
    timeout: Duration,
    scheduler: Arc<Scheduler>,
}

impl VmExecutor {
    fn send(&self, dispatch: &Dispatch, peer: u16, parallel_id: usize) -> VmResult<()> {
        let entry = self.registry.resolve(dispatch.operand(0)?.object)?;
        let value = entry.read(parallel_id)?;
        let payload = serde_json::to_vec(&value)
            .map_err(|e| VmError::ExecutionFailed(format!("cannot encode {}: {}", entry.id(), e)))?;
        let token = self.data.next_outgoing(peer);
        self.transport.send(token, payload)?;
        Ok(())
    }

    fn recv(&self, dispatch: &Dispatch, peer: u16, parallel_id: usize) -> VmResult<()> {
        let entry = self.registry.resolve(dispatch.operand(0)?.object)?;
        let token = self.data.next_incoming(peer);
        let payload = self.transport.recv(token, self.timeout)?;
        let value: Value = serde_json::from_slice(&payload)
            .map_err(|e| VmError::ExecutionFailed(format!("bad payload for {}: {}", token, e)))?;
        entry.write(parallel_id, value)
    }

    fn kernel(&self, dispatch: &Dispatch, name: &str, attrs: &Value) -> VmResult<()> {
        let kernel = self.opcodes.kernel(name).ok_or_else(|| {
            VmError::ExecutionFailed(format!("opcode '{}' disappeared", name))
        })?;
        let operands = dispatch
            .operands
            .iter()
            .map(|op| Ok((*op, self.registry.resolve(op.object)?)))
            .collect::<VmResult<Vec<_>>>()?;
        let mut ctx = KernelContext::new(dispatch.id, self.rank, attrs, operands, &self.scheduler);
        kernel.execute(&mut ctx)
    }
}

impl LaneExecutor for VmExecutor {
    fn start_lane(&self, lane: StreamClass) -> VmResult<()> {
        if lane == StreamClass::Control {
            self.control.bind_thread()?;
        }
        Ok(())
    }

    fn execute(&self, _lane: StreamClass, dispatch: &Dispatch) -> VmResult<()> {
        match &dispatch.opcode {
            Opcode::NewSymbol {
                kind,
                scope,
                instances,
            } => self
                .control
                .new_symbol(dispatch.operand(0)?.object, *kind, *scope, instances),
            Opcode::DeleteSymbol => {
                self.control.delete_symbol(dispatch.operand(0)?.object);
                Ok(())
            }
            Opcode::SyncSymbol { group } => {
                self.control.sync_symbol(dispatch.operand(0)?.object, *group)
            }
            Opcode::Barrier { group } => self.control.barrier(*group),
            Opcode::Send { peer, parallel_id } => self.send(dispatch, *peer, *parallel_id),
            Opcode::Recv { peer, parallel_id } => self.recv(dispatch, *peer, *parallel_id),
            Opcode::Boxing(step) => {
                let src = self.registry.resolve(dispatch.operand(0)?.object)?;
                let dst = self.registry.resolve(dispatch.operand(1)?.object)?;
                let piece = self.boxing.apply(step, &src.snapshot())?;
                dst.write(step.parallel_id, piece)
            }
            Opcode::Kernel { name, attrs } => self.kernel(dispatch, name, attrs),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and starts a [`VirtualMachine`].
pub struct VmBuilder {
    config: VmConfig,
    transport: Option<Arc<dyn Transport>>,
    boxing: Arc<dyn BoxingKernel>,
    kernels: Vec<(String, KernelSignature, Arc<dyn InstructionKernel>)>,
}

impl VmBuilder {
    fn new() -> Self {
        Self {
            config: VmConfig::default(),
            transport: None,
            boxing: Arc::new(RowBoxingKernel),
            kernels: Vec::new(),
        }
    }

    pub fn config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a private [`LoopbackHub`] endpoint for the configured rank.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the default [`RowBoxingKernel`].
    pub fn boxing_kernel(mut self, kernel: Arc<dyn BoxingKernel>) -> Self {
        self.boxing = kernel;
        self
    }

    pub fn kernel(
        mut self,
        name: impl Into<String>,
        signature: KernelSignature,
        kernel: Arc<dyn InstructionKernel>,
    ) -> Self {
        self.kernels.push((name.into(), signature, kernel));
        self
    }

    /// Validate the configuration, start every lane and return once they
    /// all accept work.
    pub fn build(self) -> VmResult<VirtualMachine> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| VmError::InvalidState(e.to_string()))?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(
                LoopbackHub::new(config.world_size)
                    .endpoint(config.rank)
                    .map_err(|e| VmError::InvalidState(e.to_string()))?,
            ),
        };
        if transport.rank() != config.rank {
            return Err(VmError::InvalidState(format!(
                "transport is bound to rank {} but the config says rank {}",
                transport.rank(),
                config.rank
            )));
        }

        let opcodes = Arc::new(OpcodeTable::new());
        for (name, signature, kernel) in self.kernels {
            opcodes.register(name, signature, kernel)?;
        }

        let groups = Arc::new(RankGroupTable::new());
        let world = groups.register(0..config.world_size)?;

        let peers = if config.network_peers.is_empty() {
            config.all_peers()
        } else {
            config.network_peers.clone()
        };
        let lane_map = LaneMap::new(config.compute_stream_count(), peers);
        let (senders, receivers) = lane_channels(lane_map.len());
        let scheduler = Arc::new(Scheduler::new(
            lane_map.clone(),
            Arc::clone(&opcodes),
            senders,
        ));

        let registry = Arc::new(ObjectRegistry::new());
        let uids = Arc::new(ThreadUidPool::new());
        let timeout = config.rpc_timeout();
        let exec = Arc::new(VmExecutor {
            rank: config.rank,
            control: ControlUnit::new(
                Arc::clone(&registry),
                Arc::clone(&groups),
                Arc::clone(&uids),
                Arc::clone(&transport),
                timeout,
            ),
            registry: Arc::clone(&registry),
            opcodes: Arc::clone(&opcodes),
            boxing: self.boxing,
            transport: Arc::clone(&transport),
            data: DataChannels::new(config.rank),
            timeout,
            scheduler: Arc::clone(&scheduler),
        });

        let pool = match LanePool::spawn(&lane_map, receivers, Arc::clone(&scheduler), exec) {
            Ok(pool) => pool,
            Err(e) => {
                scheduler.shutdown(Duration::ZERO);
                return Err(e);
            }
        };
        info!(
            rank = config.rank,
            world_size = config.world_size,
            lanes = pool.len(),
            "vm started"
        );

        Ok(VirtualMachine {
            config,
            minter: IdMinter::new(),
            registry,
            opcodes,
            groups,
            world,
            uids,
            scheduler,
            lanes: Mutex::new(Some(pool)),
        })
    }
}

impl fmt::Debug for VmBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmBuilder")
            .field("config", &self.config)
            .field("custom_transport", &self.transport.is_some())
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// VirtualMachine
// ---------------------------------------------------------------------------

/// One rank's instruction VM.
///
/// Any number of threads may submit concurrently. Dropping the VM shuts it
/// down with the configured grace period.
pub struct VirtualMachine {
    config: VmConfig,
    minter: IdMinter,
    registry: Arc<ObjectRegistry>,
    opcodes: Arc<OpcodeTable>,
    groups: Arc<RankGroupTable>,
    world: RankGroup,
    uids: Arc<ThreadUidPool>,
    scheduler: Arc<Scheduler>,
    lanes: Mutex<Option<LanePool>>,
}

impl VirtualMachine {
    pub fn builder() -> VmBuilder {
        VmBuilder::new()
    }

    /// Start a VM on `transport` with no user opcodes.
    pub fn new(config: VmConfig, transport: Arc<dyn Transport>) -> VmResult<Self> {
        Self::builder().config(config).transport(transport).build()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn rank(&self) -> u16 {
        self.config.rank
    }

    /// A fresh logical object id. Ids are never handed out twice.
    pub fn mint_id(&self) -> LogicalObjectId {
        self.minter.mint()
    }

    pub fn register_opcode(
        &self,
        name: impl Into<String>,
        signature: KernelSignature,
        kernel: Arc<dyn InstructionKernel>,
    ) -> VmResult<()> {
        self.opcodes.register(name, signature, kernel)
    }

    pub fn opcodes(&self) -> &OpcodeTable {
        &self.opcodes
    }

    pub fn register_rank_group<I>(&self, ranks: I) -> VmResult<RankGroup>
    where
        I: IntoIterator<Item = u16>,
    {
        self.groups.register(ranks)
    }

    /// Every rank in the world; always the first registered group.
    pub fn world_group(&self) -> &RankGroup {
        &self.world
    }

    /// Token factory for callers coordinating over `group` from their own
    /// thread.
    pub fn token_factory(&self, group: &RankGroup) -> TokenFactory {
        TokenFactory::new(Arc::clone(&self.uids), group.clone())
    }

    // -- submission ---------------------------------------------------------

    pub fn submit(&self, msg: InstructionMsg) -> VmResult<CompletionHandle> {
        self.scheduler.admit(msg)
    }

    /// Mint an id and submit its registration.
    pub fn new_symbol(
        &self,
        kind: SymbolKind,
        scope: ObjectScope,
        instances: Vec<Value>,
    ) -> VmResult<(LogicalObjectId, CompletionHandle)> {
        let id = self.mint_id();
        let handle = self.submit(InstructionMsg::new_symbol(id, kind, scope, instances))?;
        Ok((id, handle))
    }

    pub fn delete_symbol(&self, id: LogicalObjectId) -> VmResult<CompletionHandle> {
        self.submit(InstructionMsg::delete_symbol(id))
    }

    pub fn boxing_dispatcher(&self) -> BoxingDispatcher {
        BoxingDispatcher::new(self.scheduler.lane_map().compute_lanes())
    }

    /// Select a strategy for `req` and submit one step per destination
    /// piece of `dst`.
    pub fn submit_boxing(
        &self,
        req: &BoxingRequest,
        src: LogicalObjectId,
        dst: LogicalObjectId,
    ) -> VmResult<Vec<CompletionHandle>> {
        let steps = self.boxing_dispatcher().lower(req, src, dst)?;
        debug!(%req, steps = steps.len(), "boxing lowered");
        steps.into_iter().map(|msg| self.submit(msg)).collect()
    }

    // -- inspection ---------------------------------------------------------

    pub fn symbol_state(&self, id: LogicalObjectId) -> SymbolState {
        self.scheduler.symbol_state(id)
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Instance values of a live object.
    pub fn read_object(&self, id: LogicalObjectId) -> VmResult<Vec<Value>> {
        Ok(self.registry.resolve(id)?.snapshot())
    }

    pub fn streams(&self) -> Vec<StreamClass> {
        self.scheduler.lane_map().streams()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Admitted instructions that have not resolved yet.
    pub fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    /// Block until all admitted work resolved. `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }

    // -- shutdown -----------------------------------------------------------

    /// Stop accepting work, wait up to the configured grace period, abandon
    /// what never started and join every lane. Returns the number of
    /// abandoned instructions. Later calls return 0.
    ///
    /// Must not be called from a lane thread, i.e. from a kernel or a
    /// completion continuation.
    pub fn shutdown(&self) -> usize {
        let Some(pool) = self.lanes.lock().take() else {
            return 0;
        };
        let abandoned = self.scheduler.shutdown(self.config.shutdown_grace());
        pool.join();
        let dropped = self.registry.teardown();
        info!(
            rank = self.config.rank,
            abandoned,
            objects = dropped,
            "vm stopped"
        );
        abandoned
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("rank", &self.config.rank)
            .field("world_size", &self.config.world_size)
            .field("streams", &self.streams())
            .field("pending", &self.pending())
            .finish()
    }
}
