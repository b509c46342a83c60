//! End-to-end tests for a single-rank VM: symbol lifecycle, dependency
//! ordering, failure propagation and shutdown.

use crossbeam_channel::{bounded, unbounded};
use parking_lot::Mutex;
use ranklane_core::{ObjectScope, SymbolKind, SymbolState, VmError};
use ranklane_runtime::{
    kernel_fn, InstructionMsg, KernelSignature, Operand, OperandSpec, StreamClass, VirtualMachine,
    VmConfig,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn config(compute: usize) -> VmConfig {
    VmConfig {
        compute_streams: compute,
        rpc_timeout_ms: 1_000,
        shutdown_grace_ms: 2_000,
        ..VmConfig::default()
    }
}

fn writes_blob() -> KernelSignature {
    KernelSignature::compute(vec![OperandSpec::write(SymbolKind::Blob)])
}

fn reads_blob() -> KernelSignature {
    KernelSignature::compute(vec![OperandSpec::read(SymbolKind::Blob)])
}

fn blob(vm: &VirtualMachine, value: Value) -> ranklane_core::LogicalObjectId {
    let (id, _) = vm
        .new_symbol(SymbolKind::Blob, ObjectScope::Consistent, vec![value])
        .unwrap();
    id
}

fn kernel(name: &str, lane: u16, op: Operand, attrs: Value) -> InstructionMsg {
    InstructionMsg::kernel(name, StreamClass::Compute(lane), vec![op], attrs)
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[test]
fn lifecycle_use_never_runs_before_registration() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let vm = VirtualMachine::builder()
        .config(config(2))
        .kernel(
            "observe",
            reads_blob(),
            kernel_fn(move |ctx| {
                let state = ctx.symbol_state(0)?;
                let value = ctx.read(0, 0)?;
                sink.lock().push((state, value));
                Ok(())
            }),
        )
        .build()
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let id = blob(&vm, json!([i]));
        let msg = kernel("observe", (i % 2) as u16, Operand::read(id), Value::Null);
        handles.push(vm.submit(msg).unwrap());
    }
    for handle in handles {
        assert_eq!(handle.wait(), Ok(()));
    }
    let seen = seen.lock();
    assert_eq!(seen.len(), 20);
    assert!(seen.iter().all(|(state, _)| *state == SymbolState::Live));
    let mut values: Vec<i64> = seen.iter().map(|(_, v)| v[0].as_i64().unwrap()).collect();
    values.sort_unstable();
    assert_eq!(values, (0..20).collect::<Vec<_>>());
}

#[test]
fn lifecycle_register_use_delete_across_threads() {
    let observed = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&observed);
    let vm = Arc::new(
        VirtualMachine::builder()
            .config(config(1))
            .kernel(
                "observe",
                reads_blob(),
                kernel_fn(move |ctx| {
                    *sink.lock() = Some(ctx.symbol_state(0)?);
                    Ok(())
                }),
            )
            .build()
            .unwrap(),
    );

    let (id_tx, id_rx) = bounded(1);
    let (used_tx, used_rx) = bounded(1);

    let owner = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || {
            let (id, registered) = vm
                .new_symbol(SymbolKind::Blob, ObjectScope::Consistent, vec![json!([1, 2])])
                .unwrap();
            id_tx.send(id).unwrap();
            used_rx.recv().unwrap();
            let deleted = vm.delete_symbol(id).unwrap();
            (registered.wait(), deleted.wait(), id)
        })
    };
    let user = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || {
            let id = id_rx.recv().unwrap();
            let outcome = vm
                .submit(kernel("observe", 0, Operand::read(id), Value::Null))
                .unwrap()
                .wait();
            used_tx.send(()).unwrap();
            outcome
        })
    };

    assert_eq!(user.join().unwrap(), Ok(()));
    let (registered, deleted, id) = owner.join().unwrap();
    assert_eq!(registered, Ok(()));
    assert_eq!(deleted, Ok(()));
    assert_eq!(*observed.lock(), Some(SymbolState::Live));
    assert_eq!(vm.symbol_state(id), SymbolState::Unregistered);
    assert!(!vm.registry().is_live(id));
}

#[test]
fn lifecycle_delete_waits_for_earlier_readers() {
    let (gate_tx, gate_rx) = unbounded::<()>();
    let vm = VirtualMachine::builder()
        .config(config(1))
        .kernel(
            "slow_read",
            reads_blob(),
            kernel_fn(move |ctx| {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                ctx.read(0, 0).map(|_| ())
            }),
        )
        .build()
        .unwrap();

    let id = blob(&vm, json!("payload"));
    let read = vm.submit(kernel("slow_read", 0, Operand::read(id), Value::Null)).unwrap();
    let delete = vm.delete_symbol(id).unwrap();
    assert_eq!(vm.symbol_state(id), SymbolState::Deleting);
    assert!(matches!(
        vm.submit(kernel("slow_read", 0, Operand::read(id), Value::Null)),
        Err(VmError::InvalidState(_))
    ));

    gate_tx.send(()).unwrap();
    assert_eq!(read.wait(), Ok(()));
    assert_eq!(delete.wait(), Ok(()));
    assert_eq!(vm.symbol_state(id), SymbolState::Unregistered);
}

#[test]
fn lifecycle_deleted_ids_stay_dead() {
    let vm = VirtualMachine::builder().config(config(1)).build().unwrap();
    let id = blob(&vm, Value::Null);
    vm.delete_symbol(id).unwrap().wait().unwrap();

    let again = vm.submit(InstructionMsg::new_symbol(
        id,
        SymbolKind::Blob,
        ObjectScope::Consistent,
        vec![Value::Null],
    ));
    assert!(matches!(again, Err(VmError::InvalidState(_))));
    assert!(matches!(vm.delete_symbol(id), Err(VmError::InvalidState(_))));
    assert!(matches!(vm.read_object(id), Err(VmError::InvalidState(_))));
    assert_eq!(vm.stats().rejected, 2);
}

#[test]
fn lifecycle_mirrored_values_are_replicated_or_checked() {
    let vm = VirtualMachine::builder().config(config(1)).build().unwrap();
    let (id, handle) = vm
        .new_symbol(
            SymbolKind::Blob,
            ObjectScope::Mirrored { parallel_num: 3 },
            vec![json!(7)],
        )
        .unwrap();
    handle.wait().unwrap();
    assert_eq!(vm.read_object(id).unwrap(), vec![json!(7); 3]);

    let wrong = vm.new_symbol(
        SymbolKind::Blob,
        ObjectScope::Mirrored { parallel_num: 3 },
        vec![json!(1), json!(2)],
    );
    assert!(matches!(wrong, Err(VmError::InvalidInstruction(_))));
}

// ===========================================================================
// Ordering
// ===========================================================================

#[test]
fn ordering_dependent_writes_follow_submission_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let vm = VirtualMachine::builder()
        .config(config(3))
        .kernel(
            "append",
            writes_blob(),
            kernel_fn(move |ctx| {
                let tag = ctx.attrs()["tag"].clone();
                let mut rows = ctx.read(0, 0)?;
                if let Value::Array(items) = &mut rows {
                    items.push(tag.clone());
                }
                ctx.write(0, 0, rows)?;
                sink.lock().push(tag);
                Ok(())
            }),
        )
        .build()
        .unwrap();

    let id = blob(&vm, json!([]));
    let handles: Vec<_> = (0..30)
        .map(|i| {
            vm.submit(kernel("append", (i % 3) as u16, Operand::write(id), json!({ "tag": i })))
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }
    let expected: Vec<Value> = (0..30).map(|i| json!(i)).collect();
    assert_eq!(*log.lock(), expected);
    assert_eq!(vm.read_object(id).unwrap(), vec![Value::Array(expected)]);
}

#[test]
fn ordering_disjoint_work_is_not_serialized() {
    let (gate_tx, gate_rx) = unbounded::<()>();
    let vm = VirtualMachine::builder()
        .config(config(2))
        .kernel(
            "park",
            writes_blob(),
            kernel_fn(move |_| {
                gate_rx
                    .recv_timeout(Duration::from_secs(5))
                    .map_err(|_| VmError::ExecutionFailed("gate never opened".into()))
            }),
        )
        .kernel("touch", writes_blob(), kernel_fn(|_| Ok(())))
        .build()
        .unwrap();

    let a = blob(&vm, Value::Null);
    let b = blob(&vm, Value::Null);
    let mut parked = vm.submit(kernel("park", 0, Operand::write(a), Value::Null)).unwrap();
    let quick = vm.submit(kernel("touch", 1, Operand::write(b), Value::Null)).unwrap();

    assert_eq!(quick.wait(), Ok(()));
    assert!(parked.try_outcome().is_none());
    gate_tx.send(()).unwrap();
    assert_eq!(parked.wait(), Ok(()));
}

#[test]
fn ordering_continuation_runs_before_handle_resolves() {
    let vm = VirtualMachine::builder()
        .config(config(1))
        .kernel("touch", writes_blob(), kernel_fn(|_| Ok(())))
        .build()
        .unwrap();
    let id = blob(&vm, Value::Null);
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let handle = vm
        .submit(
            kernel("touch", 0, Operand::write(id), Value::Null)
                .on_complete(move |outcome| flag.store(outcome.is_ok(), Ordering::SeqCst)),
        )
        .unwrap();
    assert_eq!(handle.wait(), Ok(()));
    assert!(fired.load(Ordering::SeqCst));
}

// ===========================================================================
// Failure propagation
// ===========================================================================

#[test]
fn failure_propagates_to_dependents_only() {
    let vm = VirtualMachine::builder()
        .config(config(2))
        .kernel(
            "explode",
            writes_blob(),
            kernel_fn(|_| panic!("kernel blew up")),
        )
        .kernel("touch", writes_blob(), kernel_fn(|_| Ok(())))
        .kernel("peek", reads_blob(), kernel_fn(|_| Ok(())))
        .build()
        .unwrap();

    let a = blob(&vm, Value::Null);
    let b = blob(&vm, Value::Null);
    let root = vm.submit(kernel("explode", 0, Operand::write(a), Value::Null)).unwrap();
    let root_id = root.id().as_u64();
    let child = vm.submit(kernel("peek", 1, Operand::read(a), Value::Null)).unwrap();
    let child_id = child.id().as_u64();
    let sibling = vm.submit(kernel("touch", 1, Operand::write(b), Value::Null)).unwrap();

    match root.wait() {
        Err(VmError::ExecutionFailed(msg)) => assert!(msg.contains("kernel blew up")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(
        child.wait(),
        Err(VmError::UpstreamFailed {
            instruction: child_id,
            root: root_id
        })
    );
    assert_eq!(sibling.wait(), Ok(()));

    // The VM keeps running, and the poisoned blob can still be deleted.
    vm.delete_symbol(a).unwrap().wait().unwrap();
    assert!(vm.wait_idle(Duration::from_secs(5)));
    let stats = vm.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.upstream_failed, 1);
}

#[test]
fn failure_kernel_cannot_write_read_only_operand() {
    let vm = VirtualMachine::builder()
        .config(config(1))
        .kernel(
            "sneaky",
            reads_blob(),
            kernel_fn(|ctx| ctx.write(0, 0, json!("overwritten"))),
        )
        .build()
        .unwrap();
    let id = blob(&vm, json!("original"));
    let outcome = vm
        .submit(kernel("sneaky", 0, Operand::read(id), Value::Null))
        .unwrap()
        .wait();
    assert!(matches!(outcome, Err(VmError::ExecutionFailed(_))));
    assert_eq!(vm.read_object(id).unwrap(), vec![json!("original")]);
}

// ===========================================================================
// Configuration and shutdown
// ===========================================================================

#[test]
fn config_is_validated_at_build() {
    let bad = VmConfig {
        rank: 3,
        world_size: 2,
        ..VmConfig::default()
    };
    assert!(matches!(
        VirtualMachine::builder().config(bad).build(),
        Err(VmError::InvalidState(_))
    ));

    let hub = ranklane_runtime::LoopbackHub::new(2);
    let wrong_rank = VirtualMachine::builder()
        .config(VmConfig {
            world_size: 2,
            ..config(1)
        })
        .transport(Arc::new(hub.endpoint(1).unwrap()))
        .build();
    assert!(matches!(wrong_rank, Err(VmError::InvalidState(_))));
}

#[test]
fn vm_exposes_its_lanes() {
    let vm = VirtualMachine::builder()
        .config(VmConfig {
            world_size: 3,
            network_peers: vec![2],
            ..config(2)
        })
        .build()
        .unwrap();
    assert_eq!(
        vm.streams(),
        vec![
            StreamClass::Control,
            StreamClass::Compute(0),
            StreamClass::Compute(1),
            StreamClass::Network(2),
        ]
    );
    assert_eq!(vm.world_group().ranks, vec![0, 1, 2]);
    assert_eq!(vm.world_group().id.as_u8(), 0);
}

#[test]
fn shutdown_abandons_queued_work() {
    let (started_tx, started_rx) = unbounded::<()>();
    let vm = VirtualMachine::builder()
        .config(VmConfig {
            shutdown_grace_ms: 50,
            ..config(1)
        })
        .kernel(
            "stall",
            writes_blob(),
            kernel_fn(move |_| {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_millis(300));
                Ok(())
            }),
        )
        .build()
        .unwrap();

    let id = blob(&vm, Value::Null);
    let running = vm.submit(kernel("stall", 0, Operand::write(id), Value::Null)).unwrap();
    let queued = vm.submit(kernel("stall", 0, Operand::write(id), Value::Null)).unwrap();
    let queued_id = queued.id().as_u64();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(vm.shutdown(), 1);
    assert_eq!(running.wait(), Ok(()));
    assert_eq!(queued.wait(), Err(VmError::Abandoned(queued_id)));
    assert!(matches!(
        vm.submit(kernel("stall", 0, Operand::write(id), Value::Null)),
        Err(VmError::InvalidState(_))
    ));
    assert_eq!(vm.shutdown(), 0);
    assert!(vm.registry().is_empty());
}
