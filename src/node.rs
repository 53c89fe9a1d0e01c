use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};

use crate::flags::NodeFlags;
use crate::NodeId;
use crate::Position;

/// A lineage endpoint: a coalescent time (in units of `Ne`
/// generations) and the allele state of the lineage at each
/// mutation site. Absent sites read as the ancestral state 0.
#[derive(Clone, Debug)]
pub struct Node {
    time: f64,
    flags: NodeFlags,
    states: BTreeMap<Position, u8>,
}

impl Node {
    pub fn new(time: f64) -> Self {
        let flags = if time == 0.0 {
            NodeFlags::sample()
        } else {
            NodeFlags::default()
        };
        Self {
            time,
            flags,
            states: BTreeMap::new(),
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn is_sample(&self) -> bool {
        self.flags.is_sample()
    }

    pub fn get_state(&self, x: Position) -> u8 {
        self.states.get(&x).copied().unwrap_or(0)
    }

    pub fn write_state(&mut self, x: Position, state: u8) {
        if state == 0 {
            self.states.remove(&x);
        } else {
            self.states.insert(x, state);
        }
    }

    /// Sites at which this node carries the derived state.
    pub fn mutation_sites(&self) -> impl Iterator<Item = Position> + '_ {
        self.states.keys().copied()
    }
}

/// Arena owning every node of an ARG.
///
/// Regular nodes are addressed by dense indices.
/// The universal root and the transient cut node
/// live in dedicated slots addressed by
/// [`NodeId::ROOT`] and [`NodeId::CUT`].
#[derive(Clone, Debug)]
pub struct Nodes {
    nodes: Vec<Node>,
    root: Node,
    cut: Option<Node>,
}

impl Default for Nodes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nodes {
    pub fn new() -> Self {
        Self {
            nodes: vec![],
            root: Node::new(f64::INFINITY),
            cut: None,
        }
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId::new(self.nodes.len() - 1)
    }

    /// Number of regular nodes. The root and cut slots are not counted.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        match id {
            NodeId::ROOT => Some(&self.root),
            NodeId::CUT => self.cut.as_ref(),
            _ => id.as_index().and_then(|i| self.nodes.get(i)),
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        match id {
            NodeId::ROOT => Some(&mut self.root),
            NodeId::CUT => self.cut.as_mut(),
            _ => id.as_index().and_then(|i| self.nodes.get_mut(i)),
        }
    }

    pub fn time(&self, id: NodeId) -> f64 {
        self[id].time
    }

    pub fn state(&self, id: NodeId, x: Position) -> u8 {
        self[id].get_state(x)
    }

    pub fn write_state(&mut self, id: NodeId, x: Position, state: u8) {
        self[id].write_state(x, state)
    }

    pub fn has_cut(&self) -> bool {
        self.cut.is_some()
    }

    pub(crate) fn set_cut(&mut self, time: f64) -> NodeId {
        self.cut = Some(Node::new(time));
        NodeId::CUT
    }

    pub(crate) fn clear_cut(&mut self) {
        self.cut = None;
    }

    /// Regular nodes in index order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId::new(i), n))
    }
}

impl Index<NodeId> for Nodes {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Self::Output {
        match self.get(id) {
            Some(node) => node,
            None => panic!("{id:?} is not a live node"),
        }
    }
}

impl IndexMut<NodeId> for Nodes {
    fn index_mut(&mut self, id: NodeId) -> &mut Self::Output {
        match self.get_mut(id) {
            Some(node) => node,
            None => panic!("{id:?} is not a live node"),
        }
    }
}
