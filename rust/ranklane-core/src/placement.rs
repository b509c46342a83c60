//! Placement and distribution descriptors.
//!
//! These are the inputs to boxing selection: where the pieces of a tensor
//! live (a [`Placement`]) and how the logical tensor maps onto those pieces
//! (a [`Distribution`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

/// The ordered list of ranks holding one piece each. A rank may appear more
/// than once when it drives several devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub device: DeviceKind,
    pub ranks: Vec<u16>,
}

impl Placement {
    pub fn new(device: DeviceKind, ranks: Vec<u16>) -> Self {
        Self { device, ranks }
    }

    /// `n` pieces on consecutive ranks `0..n`, one device each.
    pub fn contiguous(device: DeviceKind, n: u16) -> Self {
        Self::new(device, (0..n).collect())
    }

    /// Number of pieces (the parallel cardinality).
    pub fn parallel_num(&self) -> usize {
        self.ranks.len()
    }

    /// Number of distinct ranks (machines) involved.
    pub fn machine_count(&self) -> usize {
        self.ranks.iter().collect::<BTreeSet<_>>().len()
    }

    /// Rank that owns the piece at `parallel_id`.
    pub fn rank_of(&self, parallel_id: usize) -> Option<u16> {
        self.ranks.get(parallel_id).copied()
    }
}

/// How a logical tensor is laid out over the pieces of a placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    /// Each piece holds a slice along `axis`.
    Split { axis: usize },
    /// Each piece holds the whole tensor.
    Broadcast,
    /// Each piece holds an addend; the logical value is their sum.
    PartialSum,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Split { axis } => write!(f, "S({})", axis),
            Distribution::Broadcast => write!(f, "B"),
            Distribution::PartialSum => write!(f, "P"),
        }
    }
}

/// One side of a boxing request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoxingEndpoint {
    pub placement: Placement,
    pub distribution: Distribution,
}

impl BoxingEndpoint {
    pub fn new(placement: Placement, distribution: Distribution) -> Self {
        Self {
            placement,
            distribution,
        }
    }

    pub fn parallel_num(&self) -> usize {
        self.placement.parallel_num()
    }
}

impl fmt::Display for BoxingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{}",
            self.distribution,
            self.placement.parallel_num(),
            self.placement.device
        )
    }
}
