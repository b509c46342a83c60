//! Stream lanes: one OS thread per FIFO execution lane.
//!
//! Lane 0 is the control lane, followed by the compute lanes and then one
//! network lane per configured peer. A lane only ever holds work whose
//! dependencies are already satisfied; it never blocks on another lane.

use crate::instruction::{Dispatch, StreamClass};
use crate::scheduler::Scheduler;
use crossbeam_channel::{unbounded, Receiver, Sender};
use ranklane_core::{VmError, VmResult};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

// ---------------------------------------------------------------------------
// LaneMap
// ---------------------------------------------------------------------------

/// Bidirectional mapping between [`StreamClass`] and lane index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneMap {
    compute: usize,
    peers: Vec<u16>,
}

impl LaneMap {
    pub fn new(compute: usize, peers: Vec<u16>) -> Self {
        Self { compute, peers }
    }

    pub fn len(&self) -> usize {
        1 + self.compute + self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn compute_lanes(&self) -> usize {
        self.compute
    }

    pub fn peers(&self) -> &[u16] {
        &self.peers
    }

    pub fn index(&self, stream: StreamClass) -> Option<usize> {
        match stream {
            StreamClass::Control => Some(0),
            StreamClass::Compute(n) if (n as usize) < self.compute => Some(1 + n as usize),
            StreamClass::Compute(_) => None,
            StreamClass::Network(peer) => self
                .peers
                .iter()
                .position(|p| *p == peer)
                .map(|pos| 1 + self.compute + pos),
        }
    }

    pub fn class(&self, index: usize) -> Option<StreamClass> {
        if index == 0 {
            Some(StreamClass::Control)
        } else if index <= self.compute {
            Some(StreamClass::Compute((index - 1) as u16))
        } else {
            self.peers
                .get(index - 1 - self.compute)
                .map(|peer| StreamClass::Network(*peer))
        }
    }

    pub fn streams(&self) -> Vec<StreamClass> {
        (0..self.len()).filter_map(|i| self.class(i)).collect()
    }
}

// ---------------------------------------------------------------------------
// Messages and executor seam
// ---------------------------------------------------------------------------

pub(crate) enum LaneMsg {
    Run(Arc<Dispatch>),
    Stop,
}

impl fmt::Debug for LaneMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaneMsg::Run(d) => write!(f, "Run({})", d.id),
            LaneMsg::Stop => write!(f, "Stop"),
        }
    }
}

/// Performs the side effect of an instruction on its lane thread.
pub(crate) trait LaneExecutor: Send + Sync + 'static {
    /// Called once on each lane thread before it accepts work.
    fn start_lane(&self, _lane: StreamClass) -> VmResult<()> {
        Ok(())
    }

    fn execute(&self, lane: StreamClass, dispatch: &Dispatch) -> VmResult<()>;
}

pub(crate) fn lane_channels(count: usize) -> (Vec<Sender<LaneMsg>>, Vec<Receiver<LaneMsg>>) {
    (0..count).map(|_| unbounded()).unzip()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run one instruction, turning panics and non-execution errors into
/// `ExecutionFailed`.
fn run_guarded(exec: &dyn LaneExecutor, lane: StreamClass, dispatch: &Dispatch) -> VmResult<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| exec.execute(lane, dispatch))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(VmError::ExecutionFailed(msg))) => Err(VmError::ExecutionFailed(msg)),
        Ok(Err(other)) => Err(VmError::ExecutionFailed(other.to_string())),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(instruction = %dispatch.id, %lane, "kernel panicked: {}", msg);
            Err(VmError::ExecutionFailed(format!("panic: {}", msg)))
        }
    }
}

// ---------------------------------------------------------------------------
// LanePool
// ---------------------------------------------------------------------------

fn thread_name(lane: StreamClass) -> String {
    match lane {
        StreamClass::Control => "ranklane-control".to_string(),
        StreamClass::Compute(n) => format!("ranklane-compute-{}", n),
        StreamClass::Network(peer) => format!("ranklane-net-{}", peer),
    }
}

/// The worker threads. Lanes exit when they receive `Stop`, which the
/// scheduler sends during shutdown.
pub(crate) struct LanePool {
    handles: Vec<(StreamClass, thread::JoinHandle<()>)>,
}

impl LanePool {
    /// Spawn one worker per receiver and wait until every lane has run
    /// [`LaneExecutor::start_lane`].
    pub(crate) fn spawn(
        map: &LaneMap,
        receivers: Vec<Receiver<LaneMsg>>,
        scheduler: Arc<Scheduler>,
        exec: Arc<dyn LaneExecutor>,
    ) -> VmResult<Self> {
        let (ready_tx, ready_rx) = unbounded::<VmResult<()>>();
        let mut handles = Vec::with_capacity(receivers.len());

        for (index, rx) in receivers.into_iter().enumerate() {
            let lane = map.class(index).ok_or_else(|| {
                VmError::InvalidState(format!("no stream for lane index {}", index))
            })?;
            let scheduler = Arc::clone(&scheduler);
            let exec = Arc::clone(&exec);
            let ready = ready_tx.clone();
            let handle = thread::Builder::new()
                .name(thread_name(lane))
                .spawn(move || {
                    let started = exec.start_lane(lane);
                    let ok = started.is_ok();
                    let _ = ready.send(started);
                    if ok {
                        Self::lane_loop(lane, rx, &scheduler, exec.as_ref());
                    }
                })
                .map_err(|e| {
                    VmError::ResourceExhausted(format!("cannot spawn {} lane: {}", lane, e))
                })?;
            handles.push((lane, handle));
        }
        drop(ready_tx);

        let pool = Self { handles };
        for _ in 0..pool.handles.len() {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(VmError::InvalidState("a lane exited during startup".into()))
                }
            }
        }
        Ok(pool)
    }

    fn lane_loop(
        lane: StreamClass,
        rx: Receiver<LaneMsg>,
        scheduler: &Scheduler,
        exec: &dyn LaneExecutor,
    ) {
        tracing::debug!(%lane, "lane started");
        while let Ok(msg) = rx.recv() {
            match msg {
                LaneMsg::Run(dispatch) => {
                    let outcome = run_guarded(exec, lane, &dispatch);
                    scheduler.retire(&dispatch, outcome);
                }
                LaneMsg::Stop => break,
            }
        }
        tracing::debug!(%lane, "lane stopped");
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every lane thread to exit.
    pub(crate) fn join(self) {
        for (lane, handle) in self.handles {
            if handle.join().is_err() {
                tracing::error!(%lane, "lane thread panicked outside an instruction");
            }
        }
    }
}

impl fmt::Debug for LanePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanePool")
            .field("lanes", &self.handles.iter().map(|(l, _)| *l).collect::<Vec<_>>())
            .finish()
    }
}
