//! `ranklane demo`: every rank of the configured world runs the same
//! register/use/delete program on its own VM, all wired to one loopback hub.

use crate::colors::{bold, gray, outcome_tag, status_label, yellow};
use ranklane_core::{
    BoxingEndpoint, DeviceKind, Distribution, ObjectScope, Placement, SymbolKind, VmError,
    VmResult,
};
use ranklane_runtime::{
    kernel_fn, BoxingRequest, CompletionHandle, InstructionMsg, KernelSignature, LoopbackHub,
    Operand, OperandSpec, StreamClass, VirtualMachine, VmConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use tracing::info;

fn scale(value: &Value, factor: i64) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| scale(v, factor)).collect()),
        Value::Number(n) => n.as_i64().map_or(Value::Null, |n| json!(n * factor)),
        other => other.clone(),
    }
}

fn total(value: &Value) -> i64 {
    match value {
        Value::Array(items) => items.iter().map(total).sum(),
        Value::Number(n) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

fn build(config: VmConfig, hub: &Arc<LoopbackHub>) -> VmResult<VirtualMachine> {
    let transport = hub
        .endpoint(config.rank)
        .map_err(|e| VmError::InvalidState(e.to_string()))?;
    VirtualMachine::builder()
        .config(config)
        .transport(Arc::new(transport))
        .kernel(
            "fill",
            KernelSignature::compute(vec![OperandSpec::write(SymbolKind::Blob)]),
            kernel_fn(|ctx| {
                let rows = ctx.attrs()["rows"].clone();
                for pid in 0..ctx.object(0)?.instance_count() {
                    let piece = rows.get(pid).cloned().unwrap_or(Value::Null);
                    ctx.write(0, pid, piece)?;
                }
                Ok(())
            }),
        )
        .kernel(
            "scale",
            KernelSignature::compute(vec![OperandSpec::write(SymbolKind::Blob)]),
            kernel_fn(|ctx| {
                let factor = ctx.attrs()["factor"].as_i64().unwrap_or(1);
                for pid in 0..ctx.object(0)?.instance_count() {
                    let scaled = scale(&ctx.read(0, pid)?, factor);
                    ctx.write(0, pid, scaled)?;
                }
                Ok(())
            }),
        )
        .kernel(
            "total",
            KernelSignature::compute(vec![
                OperandSpec::read(SymbolKind::Blob),
                OperandSpec::write(SymbolKind::Blob),
            ]),
            kernel_fn(|ctx| {
                let sum: i64 = ctx.object(0)?.snapshot().iter().map(total).sum();
                ctx.write(1, 0, json!(sum))
            }),
        )
        .build()
}

/// The program one rank runs. Returns printable outcome lines and the
/// number of failed instructions.
fn program(vm: &VirtualMachine) -> VmResult<(Vec<String>, usize)> {
    let lanes = vm.config().compute_stream_count();
    let lane = |i: usize| StreamClass::Compute((i % lanes) as u16);
    let world = vm.world_group().clone();
    let mut steps: Vec<(String, CompletionHandle)> = Vec::new();

    let (desc, h) = vm.new_symbol(
        SymbolKind::ParallelDesc,
        ObjectScope::Consistent,
        vec![json!({ "device": "cpu", "ranks": world.ranks })],
    )?;
    steps.push((format!("new_symbol {}", desc), h));
    steps.push((
        format!("sync_symbol {}", desc),
        vm.submit(InstructionMsg::sync_symbol(desc, world.id))?,
    ));

    let (a, h) = vm.new_symbol(
        SymbolKind::Blob,
        ObjectScope::Mirrored { parallel_num: 2 },
        vec![Value::Null],
    )?;
    steps.push((format!("new_symbol {}", a), h));
    let (b, h) = vm.new_symbol(SymbolKind::Blob, ObjectScope::Consistent, vec![Value::Null])?;
    steps.push((format!("new_symbol {}", b), h));
    let (c, h) = vm.new_symbol(SymbolKind::Blob, ObjectScope::Consistent, vec![json!(0)])?;
    steps.push((format!("new_symbol {}", c), h));

    let rows = json!([[[1, 2], [3, 4]], [[5, 6]]]);
    steps.push((
        format!("fill {}", a),
        vm.submit(InstructionMsg::kernel(
            "fill",
            lane(0),
            vec![Operand::write(a)],
            json!({ "rows": rows }),
        ))?,
    ));
    steps.push((
        format!("scale {}", a),
        vm.submit(InstructionMsg::kernel(
            "scale",
            lane(1),
            vec![Operand::write(a)],
            json!({ "factor": vm.rank() as i64 + 1 }),
        ))?,
    ));

    let req = BoxingRequest::new(
        BoxingEndpoint::new(
            Placement::contiguous(DeviceKind::Cpu, 2),
            Distribution::Split { axis: 0 },
        ),
        BoxingEndpoint::new(Placement::contiguous(DeviceKind::Cpu, 1), Distribution::Broadcast),
    );
    for h in vm.submit_boxing(&req, a, b)? {
        steps.push((format!("boxing {} -> {}", a, b), h));
    }
    steps.push((
        format!("total {} -> {}", b, c),
        vm.submit(InstructionMsg::kernel(
            "total",
            lane(2),
            vec![Operand::read(b), Operand::write(c)],
            Value::Null,
        ))?,
    ));
    steps.push((
        format!("barrier {}", world.id),
        vm.submit(InstructionMsg::barrier(world.id))?,
    ));

    let mut lines = Vec::new();
    let mut failed = 0;
    for (label, handle) in steps {
        match handle.wait() {
            Ok(()) => lines.push(format!("  {} {}", outcome_tag(true), label)),
            Err(e) => {
                failed += 1;
                lines.push(format!("  {} {} {}", outcome_tag(false), label, gray(&e.to_string())));
            }
        }
    }
    if let Ok(values) = vm.read_object(c) {
        let sum = values.first().cloned().unwrap_or(Value::Null);
        lines.push(format!("  {} {}", yellow("sum "), sum));
    }

    for id in [a, b, c, desc] {
        let outcome = vm.delete_symbol(id)?.wait();
        match outcome {
            Ok(()) => lines.push(format!("  {} delete_symbol {}", outcome_tag(true), id)),
            Err(e) => {
                failed += 1;
                lines.push(format!(
                    "  {} delete_symbol {} {}",
                    outcome_tag(false),
                    id,
                    gray(&e.to_string())
                ));
            }
        }
    }
    Ok((lines, failed))
}

pub fn run(config: &VmConfig) -> VmResult<()> {
    config
        .validate()
        .map_err(|e| VmError::InvalidState(e.to_string()))?;
    let world_size = config.world_size;
    let hub = LoopbackHub::new(world_size);
    info!(world_size, "starting demo world");

    let workers: Vec<_> = (0..world_size)
        .map(|rank| {
            let config = VmConfig {
                rank,
                network_peers: Vec::new(),
                ..config.clone()
            };
            let hub = Arc::clone(&hub);
            thread::Builder::new()
                .name(format!("demo-rank-{}", rank))
                .spawn(move || -> VmResult<(Vec<String>, usize, String)> {
                    let vm = build(config, &hub)?;
                    let (lines, failed) = program(&vm)?;
                    let stats = vm.stats();
                    vm.shutdown();
                    let summary = format!(
                        "admitted {} retired {} failed {} upstream {} abandoned {}",
                        stats.admitted,
                        stats.retired,
                        stats.failed,
                        stats.upstream_failed,
                        stats.abandoned
                    );
                    Ok((lines, failed, summary))
                })
                .map_err(|e| {
                    VmError::ResourceExhausted(format!("cannot spawn rank {}: {}", rank, e))
                })
        })
        .collect::<VmResult<Vec<_>>>()?;

    let mut failed = 0;
    for (rank, worker) in workers.into_iter().enumerate() {
        let (lines, rank_failed, summary) = worker
            .join()
            .map_err(|_| VmError::ExecutionFailed(format!("rank {} panicked", rank)))??;
        println!("{} {}", status_label("Rank"), bold(&rank.to_string()));
        for line in lines {
            println!("{}", line);
        }
        println!("  {}", gray(&summary));
        failed += rank_failed;
    }

    if failed > 0 {
        return Err(VmError::ExecutionFailed(format!(
            "{} instruction(s) failed",
            failed
        )));
    }
    Ok(())
}
