//! Ancestral recombination graphs under the SMC' model.
//!
//! An [`Arg`] stores the genealogy of a sample as the local tree at
//! position zero plus a [`Recombination`] event at every breakpoint.
//! Local trees are never stored per position. They are replayed
//! from a known tree by applying the events in order.

use nohash::BuildNoHashHasher;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

mod arg;
mod cut;
mod error;
mod fitch;
mod flags;
mod likelihood;
mod mutations;
mod node;
mod rate_map;
mod recombination;
mod records;
mod rewire;
mod smc;
mod tree;

#[cfg(test)]
mod arg_fixtures;

pub use arg::Arg;
pub use cut::CutPoint;
pub use error::ArgError;
pub use error::Result;
pub use fitch::FitchReconstruction;
pub use flags::NodeFlags;
pub use node::Node;
pub use node::Nodes;
pub use rate_map::RateMap;
pub use recombination::derive_bookkeeping;
pub use recombination::RecombInfo;
pub use recombination::Recombination;
pub use records::ArgFiles;
pub use smc::SmcSampler;
pub use tree::Tree;

type NodeHash = HashSet<NodeId, BuildNoHashHasher<i32>>;
type NodeMap<V> = HashMap<NodeId, V, BuildNoHashHasher<i32>>;

/// Ordered set of branches.
pub type BranchSet = BTreeSet<Branch>;

/// A genomic coordinate.
///
/// Ordered by [`f64::total_cmp`] so that it can key ordered maps.
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub struct Position(f64);

impl Position {
    pub const ZERO: Self = Self(0.0);
    /// Key of the boundary event past the end of the sequence.
    pub const END: Self = Self(f64::INFINITY);

    pub fn new(x: f64) -> Self {
        Self(x)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_end(&self) -> bool {
        self.0 == f64::INFINITY
    }
}

impl From<f64> for Position {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Position {}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a node in the [`Nodes`] arena.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct NodeId(i32);

impl NodeId {
    /// The universal root, at time +∞.
    pub const ROOT: Self = Self(-1);
    /// The transient node that a lineage hangs from while it is
    /// detached from the graph.
    pub const CUT: Self = Self(-2);
    const NULL: Self = Self(i32::MIN);

    pub fn new(index: usize) -> Self {
        assert!(index <= i32::MAX as usize);
        Self(index as i32)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    /// `None` for the reserved ids.
    pub fn as_index(&self) -> Option<usize> {
        if self.0 >= 0 {
            Some(self.0 as usize)
        } else {
            None
        }
    }
}

/// A tree edge. `lower` is a child of `upper`.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Branch {
    pub lower: NodeId,
    pub upper: NodeId,
}

impl Branch {
    pub fn new(lower: NodeId, upper: NodeId) -> Self {
        Self { lower, upper }
    }

    /// The "no edge" sentinel.
    pub fn null() -> Self {
        Self {
            lower: NodeId::NULL,
            upper: NodeId::NULL,
        }
    }

    pub fn is_null(&self) -> bool {
        self.lower == NodeId::NULL && self.upper == NodeId::NULL
    }

    pub fn into_option(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }

    pub fn is_root_branch(&self) -> bool {
        self.upper == NodeId::ROOT
    }
}

impl Default for Branch {
    fn default() -> Self {
        Self::null()
    }
}
