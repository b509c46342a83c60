//! Boxing dispatch: redistributing a tensor between two placements.
//!
//! Strategy selection is a pure function of the two [`BoxingEndpoint`]s.
//! [`BoxingDispatcher`] lowers the chosen strategy into one instruction per
//! destination piece; the numeric work happens in a [`BoxingKernel`] that
//! the caller installs on the VM.
//!
//! # Selection rules
//!
//! | source       | destination            | strategy                     |
//! |--------------|------------------------|------------------------------|
//! | `X` x n      | `X` x n                | `OneToOne`                   |
//! | `S`/`B`      | `S`/`B`                | `ConcatSplit(axis_in, axis_out)` |
//! | `B`          | `P`                    | `BroadcastToPartial`         |
//! | `P` x n      | `S` x n                | `ReduceScatterToLocalAdd`    |
//! | `P` x n      | `P` x m, m < n, m \| n | `ReduceLocalAddToGlobalAdd`  |
//! | `P`          | `B`                    | `ReduceGlobalAddToGather`    |
//!
//! Anything else is [`VmError::UnsupportedBoxing`].

use crate::instruction::InstructionMsg;
use ranklane_core::{BoxingEndpoint, Distribution, LogicalObjectId, VmError, VmResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::ops::Range;

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BoxingStrategy {
    OneToOne,
    /// Concatenate the source pieces along `axis_in` (or take any replica
    /// when `None`), then split along `axis_out` (or replicate when `None`).
    ConcatSplit {
        axis_in: Option<usize>,
        axis_out: Option<usize>,
    },
    BroadcastToPartial,
    ReduceScatterToLocalAdd,
    ReduceLocalAddToGlobalAdd,
    ReduceGlobalAddToGather,
}

impl BoxingStrategy {
    /// Whether the strategy is a step of a reduce chain and so needs an add
    /// box (a partial-sum source).
    pub fn is_reduce(&self) -> bool {
        matches!(
            self,
            BoxingStrategy::ReduceScatterToLocalAdd
                | BoxingStrategy::ReduceLocalAddToGlobalAdd
                | BoxingStrategy::ReduceGlobalAddToGather
        )
    }
}

fn fmt_axis(axis: Option<usize>) -> String {
    axis.map_or_else(|| "-".to_string(), |a| a.to_string())
}

impl fmt::Display for BoxingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoxingStrategy::OneToOne => write!(f, "one_to_one"),
            BoxingStrategy::ConcatSplit { axis_in, axis_out } => write!(
                f,
                "concat_split({}, {})",
                fmt_axis(*axis_in),
                fmt_axis(*axis_out)
            ),
            BoxingStrategy::BroadcastToPartial => write!(f, "broadcast_to_partial"),
            BoxingStrategy::ReduceScatterToLocalAdd => write!(f, "reduce_scatter_to_local_add"),
            BoxingStrategy::ReduceLocalAddToGlobalAdd => {
                write!(f, "reduce_local_add_to_global_add")
            }
            BoxingStrategy::ReduceGlobalAddToGather => write!(f, "reduce_global_add_to_gather"),
        }
    }
}

/// Source and destination of a redistribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxingRequest {
    pub src: BoxingEndpoint,
    pub dst: BoxingEndpoint,
}

impl BoxingRequest {
    pub fn new(src: BoxingEndpoint, dst: BoxingEndpoint) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for BoxingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// `Some(axis)` for a split, `Some(None)` for a broadcast, `None` for a
/// partial sum (which cannot be concatenated or split).
fn concat_axis(dist: Distribution) -> Option<Option<usize>> {
    match dist {
        Distribution::Split { axis } => Some(Some(axis)),
        Distribution::Broadcast => Some(None),
        Distribution::PartialSum => None,
    }
}

fn admits(strategy: BoxingStrategy, req: &BoxingRequest) -> Result<(), String> {
    let (s, d) = (req.src.distribution, req.dst.distribution);
    let (m, n) = (req.src.parallel_num(), req.dst.parallel_num());
    if m == 0 || n == 0 {
        return Err("both sides need at least one piece".into());
    }
    if strategy.is_reduce() && s != Distribution::PartialSum {
        return Err(format!("{} needs an add box (partial-sum source)", strategy));
    }
    let ok = match strategy {
        BoxingStrategy::OneToOne => m == n && s == d,
        BoxingStrategy::ConcatSplit { axis_in, axis_out } => {
            concat_axis(s) == Some(axis_in) && concat_axis(d) == Some(axis_out)
        }
        BoxingStrategy::BroadcastToPartial => {
            s == Distribution::Broadcast && d == Distribution::PartialSum
        }
        BoxingStrategy::ReduceScatterToLocalAdd => {
            matches!(d, Distribution::Split { .. }) && m == n
        }
        BoxingStrategy::ReduceLocalAddToGlobalAdd => {
            d == Distribution::PartialSum && n < m && m % n == 0
        }
        BoxingStrategy::ReduceGlobalAddToGather => d == Distribution::Broadcast,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{} does not apply", strategy))
    }
}

/// Validate a caller-chosen strategy against a request.
pub fn check_strategy(req: &BoxingRequest, strategy: BoxingStrategy) -> VmResult<()> {
    admits(strategy, req)
        .map_err(|why| VmError::UnsupportedBoxing(format!("{}: {}", req, why)))
}

/// Pick the strategy for a request. Never falls back silently.
pub fn select_strategy(req: &BoxingRequest) -> VmResult<BoxingStrategy> {
    let mut candidates = vec![BoxingStrategy::OneToOne];
    if let (Some(axis_in), Some(axis_out)) = (
        concat_axis(req.src.distribution),
        concat_axis(req.dst.distribution),
    ) {
        candidates.push(BoxingStrategy::ConcatSplit { axis_in, axis_out });
    }
    candidates.extend([
        BoxingStrategy::BroadcastToPartial,
        BoxingStrategy::ReduceScatterToLocalAdd,
        BoxingStrategy::ReduceLocalAddToGlobalAdd,
        BoxingStrategy::ReduceGlobalAddToGather,
    ]);
    candidates
        .into_iter()
        .find(|s| admits(*s, req).is_ok())
        .ok_or_else(|| VmError::UnsupportedBoxing(format!("no strategy for {}", req)))
}

// ---------------------------------------------------------------------------
// Steps and lowering
// ---------------------------------------------------------------------------

/// One destination piece of a boxing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoxingStep {
    pub strategy: BoxingStrategy,
    /// Destination piece this step produces.
    pub parallel_id: usize,
    pub src_parallel_num: usize,
    pub dst_parallel_num: usize,
}

/// Numeric side of boxing. `inputs` holds every source instance in parallel
/// order; the result becomes destination instance `step.parallel_id`.
pub trait BoxingKernel: Send + Sync {
    fn apply(&self, step: &BoxingStep, inputs: &[Value]) -> VmResult<Value>;
}

/// Lowers boxing requests into instructions on the compute lanes.
#[derive(Debug, Clone, Copy)]
pub struct BoxingDispatcher {
    compute_lanes: usize,
}

impl BoxingDispatcher {
    pub fn new(compute_lanes: usize) -> Self {
        Self { compute_lanes }
    }

    /// Select a strategy and emit one instruction per destination piece.
    pub fn lower(
        &self,
        req: &BoxingRequest,
        src: LogicalObjectId,
        dst: LogicalObjectId,
    ) -> VmResult<Vec<InstructionMsg>> {
        let strategy = select_strategy(req)?;
        self.lower_with(req, strategy, src, dst)
    }

    /// Like [`lower`](Self::lower) with a caller-chosen strategy.
    pub fn lower_with(
        &self,
        req: &BoxingRequest,
        strategy: BoxingStrategy,
        src: LogicalObjectId,
        dst: LogicalObjectId,
    ) -> VmResult<Vec<InstructionMsg>> {
        check_strategy(req, strategy)?;
        if self.compute_lanes == 0 {
            return Err(VmError::InvalidState("no compute lanes to box on".into()));
        }
        if src == dst {
            return Err(VmError::InvalidInstruction(format!(
                "boxing source and destination are both {}",
                src
            )));
        }
        let (m, n) = (req.src.parallel_num(), req.dst.parallel_num());
        Ok((0..n)
            .map(|parallel_id| {
                let step = BoxingStep {
                    strategy,
                    parallel_id,
                    src_parallel_num: m,
                    dst_parallel_num: n,
                };
                let lane = (parallel_id % self.compute_lanes) as u16;
                InstructionMsg::boxing(src, dst, step, lane)
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Column-id bookkeeping
// ---------------------------------------------------------------------------

/// Row count and column id of one blob taking part in a concat/split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSlice {
    pub rows: usize,
    pub col_id: i32,
}

/// Largest column id among `inputs`, or 0 when there are none.
pub fn max_col_id(inputs: &[ColumnSlice]) -> i32 {
    inputs.iter().map(|s| s.col_id).fold(0, i32::max)
}

/// Column id of every output when `inputs` are concatenated along rows and
/// re-split into pieces of `output_rows`.
///
/// Each output takes the largest column id among the inputs that overlap
/// it, so column order survives the re-split.
pub fn concat_split_col_ids(inputs: &[ColumnSlice], output_rows: &[usize]) -> VmResult<Vec<i32>> {
    let total_in: usize = inputs.iter().map(|s| s.rows).sum();
    let total_out: usize = output_rows.iter().sum();
    if total_in != total_out {
        return Err(VmError::InvalidState(format!(
            "concat of {} rows cannot split into {} rows",
            total_in, total_out
        )));
    }
    if inputs.is_empty() || output_rows.is_empty() {
        return Ok(vec![max_col_id(inputs); output_rows.len()]);
    }

    let mut out = Vec::with_capacity(output_rows.len());
    let (mut i, mut o) = (0, 0);
    let mut in_rows = inputs[0].rows;
    let mut out_rows = output_rows[0];
    let mut col_id = inputs[0].col_id;
    while o < output_rows.len() {
        if in_rows < out_rows {
            i += 1;
            in_rows += inputs[i].rows;
            col_id = col_id.max(inputs[i].col_id);
        } else if in_rows > out_rows {
            out.push(col_id);
            col_id = inputs[i].col_id;
            o += 1;
            out_rows += output_rows[o];
        } else {
            out.push(col_id);
            o += 1;
            i += 1;
            if o == output_rows.len() {
                break;
            }
            // Trailing empty outputs keep the last column id.
            if let Some(next) = inputs.get(i) {
                in_rows += next.rows;
                col_id = next.col_id;
            }
            out_rows += output_rows[o];
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// RowBoxingKernel
// ---------------------------------------------------------------------------

/// Rows of `len` owned by piece `index` of `parts` near-equal pieces.
pub fn balanced_range(len: usize, parts: usize, index: usize) -> Range<usize> {
    let base = len / parts;
    let rem = len % parts;
    let start = index * base + index.min(rem);
    let size = base + usize::from(index < rem);
    start..start + size
}

/// Reference [`BoxingKernel`] for blobs stored as JSON row arrays.
///
/// A blob instance is either an array of rows or
/// `{"rows": [...], "col_id": n}`. Only axis 0 is supported. Partial sums
/// add numbers element-wise.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowBoxingKernel;

struct Piece {
    rows: Vec<Value>,
    col_id: Option<i32>,
}

fn parse_piece(value: &Value) -> VmResult<Piece> {
    match value {
        Value::Array(rows) => Ok(Piece {
            rows: rows.clone(),
            col_id: None,
        }),
        Value::Object(map) => {
            let rows = map
                .get("rows")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| VmError::ExecutionFailed("blob object has no 'rows' array".into()))?;
            let col_id = map.get("col_id").and_then(Value::as_i64).map(|c| c as i32);
            Ok(Piece { rows, col_id })
        }
        other => Err(VmError::ExecutionFailed(format!(
            "blob instance must be an array of rows, got {}",
            other
        ))),
    }
}

fn emit(rows: Vec<Value>, col_id: Option<i32>) -> Value {
    match col_id {
        Some(col_id) => {
            let mut map = Map::new();
            map.insert("rows".into(), Value::Array(rows));
            map.insert("col_id".into(), json!(col_id));
            Value::Object(map)
        }
        None => Value::Array(rows),
    }
}

fn add_values(a: &Value, b: &Value) -> VmResult<Value> {
    match (a, b) {
        (Value::Array(x), Value::Array(y)) if x.len() == y.len() => Ok(Value::Array(
            x.iter()
                .zip(y)
                .map(|(p, q)| add_values(p, q))
                .collect::<VmResult<Vec<_>>>()?,
        )),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(p), Some(q)) => match p.checked_add(q) {
                Some(sum) => Ok(json!(sum)),
                None => Ok(json!(p as f64 + q as f64)),
            },
            _ => Ok(json!(x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0))),
        },
        _ => Err(VmError::ExecutionFailed(format!(
            "cannot add {} and {}",
            a, b
        ))),
    }
}

fn zeros_like(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(zeros_like).collect()),
        Value::Number(_) => json!(0),
        other => other.clone(),
    }
}

fn sum_pieces(pieces: &[Piece]) -> VmResult<Vec<Value>> {
    let mut iter = pieces.iter();
    let first = iter
        .next()
        .ok_or_else(|| VmError::ExecutionFailed("nothing to reduce".into()))?;
    let mut acc = Value::Array(first.rows.clone());
    for piece in iter {
        acc = add_values(&acc, &Value::Array(piece.rows.clone()))?;
    }
    match acc {
        Value::Array(rows) => Ok(rows),
        _ => Ok(Vec::new()),
    }
}

fn check_axis(axis: Option<usize>) -> VmResult<()> {
    match axis {
        None | Some(0) => Ok(()),
        Some(a) => Err(VmError::ExecutionFailed(format!(
            "row boxing only splits along axis 0, not {}",
            a
        ))),
    }
}

impl BoxingKernel for RowBoxingKernel {
    fn apply(&self, step: &BoxingStep, inputs: &[Value]) -> VmResult<Value> {
        let pieces = inputs.iter().map(parse_piece).collect::<VmResult<Vec<_>>>()?;
        let p = step.parallel_id;
        let n = step.dst_parallel_num;
        let first_col = pieces.first().and_then(|piece| piece.col_id);
        let input = |i: usize| {
            pieces.get(i).ok_or_else(|| {
                VmError::ExecutionFailed(format!("boxing input {} is missing", i))
            })
        };

        match step.strategy {
            BoxingStrategy::OneToOne => {
                let piece = input(p)?;
                Ok(emit(piece.rows.clone(), piece.col_id))
            }
            BoxingStrategy::ConcatSplit { axis_in, axis_out } => {
                check_axis(axis_in)?;
                check_axis(axis_out)?;
                let whole: Vec<Value> = match axis_in {
                    Some(_) => pieces.iter().flat_map(|piece| piece.rows.clone()).collect(),
                    None => input(0)?.rows.clone(),
                };
                let range = match axis_out {
                    Some(_) => balanced_range(whole.len(), n, p),
                    None => 0..whole.len(),
                };
                let col_id = match (first_col, axis_in, axis_out) {
                    (None, _, _) => None,
                    (Some(_), Some(_), Some(_)) => {
                        let slices: Vec<ColumnSlice> = pieces
                            .iter()
                            .map(|piece| ColumnSlice {
                                rows: piece.rows.len(),
                                col_id: piece.col_id.unwrap_or(0),
                            })
                            .collect();
                        let sizes: Vec<usize> =
                            (0..n).map(|i| balanced_range(whole.len(), n, i).len()).collect();
                        concat_split_col_ids(&slices, &sizes)?.get(p).copied()
                    }
                    (Some(_), Some(_), None) => {
                        let slices: Vec<ColumnSlice> = pieces
                            .iter()
                            .map(|piece| ColumnSlice {
                                rows: piece.rows.len(),
                                col_id: piece.col_id.unwrap_or(0),
                            })
                            .collect();
                        Some(max_col_id(&slices))
                    }
                    (Some(c), None, _) => Some(c),
                };
                Ok(emit(whole[range].to_vec(), col_id))
            }
            BoxingStrategy::BroadcastToPartial => {
                let piece = input(0)?;
                let rows = if p == 0 {
                    piece.rows.clone()
                } else {
                    piece.rows.iter().map(zeros_like).collect()
                };
                Ok(emit(rows, piece.col_id))
            }
            BoxingStrategy::ReduceScatterToLocalAdd => {
                let sum = sum_pieces(&pieces)?;
                let range = balanced_range(sum.len(), n, p);
                Ok(emit(sum[range].to_vec(), first_col))
            }
            BoxingStrategy::ReduceLocalAddToGlobalAdd => {
                let ratio = step.src_parallel_num / n.max(1);
                let start = (p * ratio).min(pieces.len());
                let end = (start + ratio).min(pieces.len());
                Ok(emit(sum_pieces(&pieces[start..end])?, first_col))
            }
            BoxingStrategy::ReduceGlobalAddToGather => Ok(emit(sum_pieces(&pieces)?, first_col)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
