use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound::Excluded;
use std::ops::Bound::Included;
use std::ops::Bound::Unbounded;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::node::Node;
use crate::node::Nodes;
use crate::rate_map::RateMap;
use crate::recombination::Recombination;
use crate::tree::Tree;
use crate::Branch;
use crate::BranchSet;
use crate::NodeId;
use crate::Position;

/// An ancestral recombination graph.
///
/// The graph is the tree at position zero plus the ordered
/// [`Recombination`] events that change it. A lineage is rewired
/// in one cycle: [`Arg::remove`] detaches it over an interval,
/// the recombination times are resampled, [`Arg::add`] grafts the
/// new material back in and [`Arg::clear_remove_info`] ends the
/// cycle.
#[derive(Debug)]
pub struct Arg {
    pub(crate) ne: f64,
    pub(crate) sequence_length: f64,
    pub(crate) nodes: Nodes,
    pub(crate) recombinations: BTreeMap<Position, Recombination>,
    pub(crate) sample_nodes: BTreeSet<NodeId>,
    pub(crate) mutation_sites: BTreeSet<Position>,
    pub(crate) mutation_branches: BTreeMap<Position, BranchSet>,
    pub(crate) bin_size: f64,
    pub(crate) coordinates: Vec<f64>,
    pub(crate) rhos: Vec<f64>,
    pub(crate) thetas: Vec<f64>,
    pub(crate) rng: StdRng,
    // Tree at `start`, without the detached lineage while a
    // rewiring is in flight.
    pub(crate) start_tree: Tree,
    // Tree at `end`.
    pub(crate) end_tree: Tree,
    pub(crate) cut_tree: Option<Tree>,
    pub(crate) cut_node: Option<NodeId>,
    pub(crate) cut_time: f64,
    pub(crate) cut_pos: Position,
    pub(crate) start: Position,
    pub(crate) end: Position,
    pub(crate) removed_branches: BTreeMap<Position, Branch>,
    pub(crate) joining_branches: BTreeMap<Position, Branch>,
}

fn is_incompatible(branches: &BranchSet) -> bool {
    let limit = if branches.iter().any(|b| b.is_root_branch()) {
        2
    } else {
        1
    };
    branches.len() > limit
}

impl Arg {
    pub fn new(ne: f64, sequence_length: f64) -> Self {
        Self::with_rng(ne, sequence_length, StdRng::from_entropy())
    }

    pub fn with_seed(ne: f64, sequence_length: f64, seed: u64) -> Self {
        Self::with_rng(ne, sequence_length, StdRng::seed_from_u64(seed))
    }

    fn with_rng(ne: f64, sequence_length: f64, rng: StdRng) -> Self {
        assert!(ne > 0.0);
        assert!(sequence_length > 0.0 && sequence_length.is_finite());
        let mut recombinations = BTreeMap::new();
        recombinations.insert(Position::ZERO, Recombination::boundary(Position::ZERO));
        recombinations.insert(Position::END, Recombination::boundary(Position::END));
        let mut mutation_branches = BTreeMap::new();
        mutation_branches.insert(Position::END, BranchSet::new());
        Self {
            ne,
            sequence_length,
            nodes: Nodes::new(),
            recombinations,
            sample_nodes: BTreeSet::new(),
            mutation_sites: [Position::END].into_iter().collect(),
            mutation_branches,
            bin_size: 0.0,
            coordinates: vec![],
            rhos: vec![],
            thetas: vec![],
            rng,
            start_tree: Tree::new(),
            end_tree: Tree::new(),
            cut_tree: None,
            cut_node: None,
            cut_time: 0.0,
            cut_pos: Position::ZERO,
            start: Position::ZERO,
            end: Position::new(sequence_length),
            removed_branches: BTreeMap::new(),
            joining_branches: BTreeMap::new(),
        }
    }

    pub fn ne(&self) -> f64 {
        self.ne
    }

    pub fn sequence_length(&self) -> f64 {
        self.sequence_length
    }

    pub(crate) fn length_pos(&self) -> Position {
        Position::new(self.sequence_length)
    }

    pub fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn recombinations(&self) -> &BTreeMap<Position, Recombination> {
        &self.recombinations
    }

    pub fn sample_nodes(&self) -> &BTreeSet<NodeId> {
        &self.sample_nodes
    }

    /// Mutation sites, ending with [`Position::END`].
    pub fn mutation_sites(&self) -> &BTreeSet<Position> {
        &self.mutation_sites
    }

    pub fn mutation_branches(&self) -> &BTreeMap<Position, BranchSet> {
        &self.mutation_branches
    }

    pub fn coordinates(&self) -> &[f64] {
        &self.coordinates
    }

    pub fn rhos(&self) -> &[f64] {
        &self.rhos
    }

    pub fn thetas(&self) -> &[f64] {
        &self.thetas
    }

    pub fn bin_num(&self) -> usize {
        self.coordinates.len().saturating_sub(1)
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn end(&self) -> Position {
        self.end
    }

    pub fn start_tree(&self) -> &Tree {
        &self.start_tree
    }

    pub fn end_tree(&self) -> &Tree {
        &self.end_tree
    }

    pub fn cut_node(&self) -> Option<NodeId> {
        self.cut_node
    }

    pub fn cut_time(&self) -> f64 {
        self.cut_time
    }

    pub fn removed_branches(&self) -> &BTreeMap<Position, Branch> {
        &self.removed_branches
    }

    pub fn joining_branches(&self) -> &BTreeMap<Position, Branch> {
        &self.joining_branches
    }

    /// Allocate a node. Nodes at time zero are samples.
    pub fn new_node(&mut self, time: f64) -> NodeId {
        assert!(time.is_finite() && time >= 0.0);
        let id = self.nodes.push(Node::new(time));
        if time == 0.0 {
            self.sample_nodes.insert(id);
        }
        id
    }

    /// Register a sample and prepare to thread it over the whole
    /// sequence with [`Arg::add`].
    pub fn add_sample(&mut self, id: NodeId) {
        self.sample_nodes.insert(id);
        let sites = self.nodes[id].mutation_sites().collect::<Vec<_>>();
        for x in sites {
            self.mutation_sites.insert(x);
            self.mutation_branches.entry(x).or_default();
        }
        self.removed_branches.clear();
        self.joining_branches.clear();
        self.removed_branches
            .insert(Position::ZERO, Branch::new(id, NodeId::ROOT));
        self.removed_branches
            .insert(self.length_pos(), Branch::null());
        self.start_tree = self.get_tree_at(Position::ZERO);
        self.cut_pos = Position::ZERO;
        self.start = Position::ZERO;
        self.end = self.length_pos();
    }

    /// Start a graph from one sample.
    pub fn build_singleton_arg(&mut self, id: NodeId) {
        self.add_sample(id);
        let branch = Branch::new(id, NodeId::ROOT);
        self.recombinations.insert(
            Position::ZERO,
            Recombination::new(Position::ZERO, BranchSet::new(), [branch].into()),
        );
        for x in self.mutation_sites.iter().filter(|x| !x.is_end()) {
            self.mutation_branches.insert(*x, [branch].into());
        }
    }

    /// Breakpoints every `bin_size`, restarted at every
    /// recombination so that no bin straddles one.
    pub fn discretize(&mut self, bin_size: f64) {
        assert!(bin_size > 0.0);
        self.bin_size = bin_size;
        self.coordinates.clear();
        let length = self.sequence_length;
        let mut breakpoints = self
            .recombinations
            .keys()
            .map(|x| x.value())
            .filter(|&x| x > 0.0 && x < length)
            .peekable();
        let mut curr = 0.0;
        while curr < length {
            self.coordinates.push(curr);
            while breakpoints.next_if(|&x| x <= curr).is_some() {}
            let grid = (curr + bin_size).min(length);
            curr = breakpoints.next_if(|&x| x <= grid).unwrap_or(grid);
        }
        self.coordinates.push(length);
    }

    /// Index of the bin containing `x`.
    pub fn get_index(&self, x: f64) -> usize {
        self.coordinates
            .partition_point(|&c| c <= x)
            .saturating_sub(1)
    }

    /// Per-bin masses from constant per-base rates.
    pub fn compute_rhos_thetas(&mut self, r: f64, m: f64) {
        let ne = self.ne;
        let widths = self
            .coordinates
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect::<Vec<_>>();
        self.rhos = widths.iter().map(|w| r * w * ne).collect();
        self.thetas = widths.iter().map(|w| m * w * ne).collect();
    }

    /// Per-bin masses from recombination and mutation maps.
    pub fn compute_rhos_thetas_from_maps(&mut self, recombination_map: &RateMap, mutation_map: &RateMap) {
        let ne = self.ne;
        self.rhos = self
            .coordinates
            .windows(2)
            .map(|w| recombination_map.segment_distance(w[0], w[1]) * ne)
            .collect();
        self.thetas = self
            .coordinates
            .windows(2)
            .map(|w| mutation_map.segment_distance(w[0], w[1]) * ne)
            .collect();
    }

    /// Replay every event at or before `x`.
    pub fn get_tree_at(&self, x: Position) -> Tree {
        let mut tree = Tree::new();
        for r in self.recombinations.range(..=x).map(|(_, r)| r) {
            tree.forward_update(r);
        }
        tree
    }

    // Replay every event strictly before `x`.
    pub(crate) fn get_tree_before(&self, x: Position) -> Tree {
        let mut tree = Tree::new();
        for r in self.recombinations.range(..x).map(|(_, r)| r) {
            tree.forward_update(r);
        }
        tree
    }

    /// Move `reference`, the tree at `x0`, to `x`.
    pub fn modify_tree_to(&self, x: Position, reference: &Tree, x0: Position) -> Tree {
        let mut tree = reference.clone();
        if x > x0 {
            for r in self
                .recombinations
                .range((Excluded(x0), Unbounded))
                .take_while(|&(&pos, _)| pos <= x)
                .map(|(_, r)| r)
            {
                tree.forward_update(r);
            }
        } else if x < x0 {
            for r in self
                .recombinations
                .range((Excluded(x), Included(x0)))
                .rev()
                .map(|(_, r)| r)
            {
                tree.backward_update(r);
            }
        }
        tree
    }

    /// Lower node of the lineage being rewired at `x`.
    pub fn get_query_node_at(&self, x: Position) -> Option<NodeId> {
        self.removed_branches
            .range(..=x)
            .next_back()
            .and_then(|(_, b)| b.into_option())
            .map(|b| b.lower)
    }

    /// End the rewiring cycle.
    pub fn clear_remove_info(&mut self) {
        self.removed_branches.clear();
        self.joining_branches.clear();
        self.cut_node = None;
        self.cut_tree = None;
        self.nodes.clear_cut();
    }

    /// Number of sites whose mapping needs more than one mutation.
    pub fn count_incompatibility(&self) -> usize {
        self.mutation_branches
            .values()
            .filter(|b| is_incompatible(b))
            .count()
    }

    pub fn num_unmapped(&self) -> usize {
        self.count_incompatibility()
    }

    /// Number of sites where the derived state sits above the root.
    pub fn count_flipping(&self) -> usize {
        self.mutation_branches
            .values()
            .filter(|b| b.len() > 1 && b.iter().any(|b| b.is_root_branch()))
            .count()
    }

    pub fn check_incompatibility(&self) {
        info!(
            incompatibilities = self.count_incompatibility(),
            "number of incompatibilities"
        );
    }

    /// Check the mapping of every site against the states on its
    /// tree and count the sites needing more than one mutation.
    ///
    /// # Panics
    ///
    /// If a disagreeing edge is missing from its site's mapping.
    pub fn check_mapping(&self) -> usize {
        let mut tree = Tree::new();
        let mut events = self.recombinations.iter().peekable();
        let mut total = 0;
        for &m in self.mutation_sites.iter().filter(|x| !x.is_end()) {
            while let Some((_, r)) = events.next_if(|&(&pos, _)| pos <= m) {
                tree.forward_update(r);
            }
            let mapped = self.mutation_branches.get(&m);
            let mut count = 0;
            for b in tree.branches() {
                if self.nodes.state(b.lower, m) != self.nodes.state(b.upper, m) {
                    assert!(
                        mapped.is_some_and(|s| s.contains(&b)),
                        "{b:?} is not mapped at site {m}"
                    );
                    if !b.is_root_branch() {
                        count += 1;
                    }
                }
            }
            if count > 1 {
                total += 1;
            }
        }
        info!(incompatibilities = total, "checked mutation mapping");
        total
    }

    /// Extra mutations needed to explain the states at `x` on `tree`.
    pub fn site_incompatibility(&self, tree: &Tree, x: Position) -> usize {
        let changes = tree
            .branches()
            .into_iter()
            .filter(|b| !b.is_root_branch())
            .filter(|b| self.nodes.state(b.lower, x) != self.nodes.state(b.upper, x))
            .count();
        changes.saturating_sub(1)
    }

    /// Breakpoints in the rewired span where a node that was
    /// deleted earlier reappears without provably sitting on a
    /// disjoint subtree.
    pub fn get_check_points(&self) -> BTreeSet<Position> {
        let mut check_points = BTreeSet::new();
        let (Some((&start, _)), Some((&end, _))) = (
            self.removed_branches.first_key_value(),
            self.removed_branches.last_key_value(),
        ) else {
            return check_points;
        };
        let mut deleted = BTreeMap::new();
        let mut spans = vec![];
        for (&pos, r) in self.recombinations.range(start..=end) {
            if let Some(p) = r.deleted_node() {
                deleted.insert(p, pos);
            }
            if let Some(x) = r.inserted_node().and_then(|q| deleted.remove(&q)) {
                spans.push((x, pos));
            }
        }
        for (x, y) in spans {
            if !self.check_disjoint_nodes(x, y) {
                check_points.insert(y);
            }
        }
        check_points
    }

    /// Whether the merging branch of the event at `x` traces forward
    /// to the target branch of the event at `y`.
    pub fn check_disjoint_nodes(&self, x: Position, y: Position) -> bool {
        let Some(first) = self.recombinations.get(&x) else {
            return false;
        };
        let Some(p) = first.deleted_node() else {
            return false;
        };
        let t = self.nodes.time(p);
        let mut b = first.merging_branch();
        for r in self.recombinations.range(x..y).map(|(_, r)| r) {
            b = r.trace_forward(&self.nodes, t, b);
            if b.is_null() {
                return false;
            }
        }
        self.recombinations
            .get(&y)
            .is_some_and(|r| b == r.target_branch())
    }

    /// Total branch length integrated along the sequence.
    pub fn get_arg_length(&self) -> f64 {
        self.arg_length_between(Position::ZERO, self.length_pos())
    }

    /// Total branch length integrated over `[x, y]`.
    pub fn arg_length_between(&self, x: Position, y: Position) -> f64 {
        let y = y.value().min(self.sequence_length);
        let mut tree = self.get_tree_at(x);
        let mut length = 0.0;
        let mut prev = x.value();
        for (&pos, r) in self.recombinations.range((Excluded(x), Unbounded)) {
            let next = pos.value().min(y);
            length += tree.length(&self.nodes) * (next - prev);
            prev = next;
            if pos.value() >= y {
                break;
            }
            tree.forward_update(r);
        }
        length
    }

    /// Length of the graph once `added` is grafted onto `joining`.
    pub fn proposal_arg_length(
        &self,
        joining: &BTreeMap<Position, Branch>,
        added: &BTreeMap<Position, Branch>,
    ) -> f64 {
        let (Some((&x, _)), Some((&y, _))) = (added.first_key_value(), added.last_key_value()) else {
            return 0.0;
        };
        let mut length = self.arg_length_between(x, y);
        for ((&pos, a), (&next, _)) in added.iter().zip(added.iter().skip(1)) {
            let span = next.value().min(self.sequence_length) - pos.value();
            let j = joining
                .range(..=pos)
                .next_back()
                .map(|(_, &b)| b)
                .unwrap_or_default();
            let join_time = self.nodes.time(a.upper);
            let h = if j.is_root_branch() {
                2.0 * join_time - self.nodes.time(j.lower) - self.cut_time
            } else {
                join_time - self.cut_time
            };
            length += h * span;
        }
        length
    }

    /// Width of the span being rewired.
    pub fn get_updated_length(&self) -> f64 {
        match (
            self.removed_branches.first_key_value(),
            self.removed_branches.last_key_value(),
        ) {
            (Some((&x, _)), Some((&y, _))) => y.value() - x.value(),
            _ => 0.0,
        }
    }
}
