use rand::Rng;

use crate::node::Nodes;
use crate::recombination::Recombination;
use crate::Branch;
use crate::BranchSet;
use crate::NodeHash;
use crate::NodeId;
use crate::NodeMap;
use crate::Position;

/// The local tree at one genomic position.
///
/// Every node in the tree other than [`NodeId::ROOT`] has exactly
/// one parent. Nodes whose parent is the root are the tops of the
/// genealogy.
#[derive(Clone, Debug, Default)]
pub struct Tree {
    parents: NodeMap<NodeId>,
    children: NodeMap<NodeHash>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.parents == other.parents
    }
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn num_branches(&self) -> usize {
        self.parents.len()
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parents.get(&node).copied()
    }

    pub fn children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children.get(&node).into_iter().flatten().copied()
    }

    pub fn contains_branch(&self, branch: &Branch) -> bool {
        self.parent(branch.lower) == Some(branch.upper)
    }

    /// All edges, sorted.
    pub fn branches(&self) -> BranchSet {
        self.parents
            .iter()
            .map(|(&lower, &upper)| Branch::new(lower, upper))
            .collect()
    }

    pub fn delete_branch(&mut self, branch: Branch) {
        assert!(
            self.contains_branch(&branch),
            "{branch:?} is not in the tree"
        );
        self.parents.remove(&branch.lower);
        if let Some(c) = self.children.get_mut(&branch.upper) {
            c.remove(&branch.lower);
            if c.is_empty() {
                self.children.remove(&branch.upper);
            }
        }
    }

    pub fn insert_branch(&mut self, branch: Branch) {
        assert!(!branch.is_null());
        if let Some(previous) = self.parents.insert(branch.lower, branch.upper) {
            assert_eq!(
                previous, branch.upper,
                "{:?} already has a parent",
                branch.lower
            );
        }
        self.children
            .entry(branch.upper)
            .or_default()
            .insert(branch.lower);
    }

    /// Move the tree from just before `r` to just after it.
    pub fn forward_update(&mut self, r: &Recombination) {
        for &b in r.deleted_branches() {
            self.delete_branch(b);
        }
        for &b in r.inserted_branches() {
            self.insert_branch(b);
        }
    }

    /// Move the tree from just after `r` to just before it.
    pub fn backward_update(&mut self, r: &Recombination) {
        for &b in r.inserted_branches() {
            self.delete_branch(b);
        }
        for &b in r.deleted_branches() {
            self.insert_branch(b);
        }
    }

    /// The edge formed between the sibling and the grandparent of
    /// `branch.lower` once `branch` is excised.
    ///
    /// Null if `branch` is null or attached to the root.
    pub fn find_joining_branch(&self, branch: Branch) -> Branch {
        if branch.is_null() || branch.is_root_branch() {
            return Branch::null();
        }
        let sibling = self.children(branch.upper).find(|&c| c != branch.lower);
        let grandparent = self.parent(branch.upper);
        match (sibling, grandparent) {
            (Some(s), Some(g)) => Branch::new(s, g),
            _ => Branch::null(),
        }
    }

    fn branch_length(nodes: &Nodes, branch: &Branch) -> f64 {
        nodes.time(branch.upper) - nodes.time(branch.lower)
    }

    fn finite_branches(&self) -> impl Iterator<Item = Branch> + '_ {
        self.parents
            .iter()
            .filter(|&(_, &upper)| upper != NodeId::ROOT)
            .map(|(&lower, &upper)| Branch::new(lower, upper))
    }

    /// Total length of the edges below the root.
    pub fn length(&self, nodes: &Nodes) -> f64 {
        self.finite_branches()
            .map(|b| Self::branch_length(nodes, &b))
            .sum()
    }

    /// A point drawn uniformly along the edges below the root.
    ///
    /// Returns `None` for a tree with no such edge.
    pub fn sample_cut_point<R: Rng>(&self, nodes: &Nodes, rng: &mut R) -> Option<(Branch, f64)> {
        let branches = self
            .branches()
            .into_iter()
            .filter(|b| !b.is_root_branch())
            .collect::<Vec<_>>();
        let total: f64 = branches
            .iter()
            .map(|b| Self::branch_length(nodes, b))
            .sum();
        let mut remaining = rng.gen::<f64>() * total;
        for b in &branches {
            let l = Self::branch_length(nodes, b);
            if remaining <= l {
                return Some((*b, nodes.time(b.lower) + remaining));
            }
            remaining -= l;
        }
        // rounding can leave a sliver past the last edge
        branches.last().map(|b| (*b, nodes.time(b.upper)))
    }

    /// Excise the lineage above `branch.lower`. With a cut node,
    /// the lineage is left hanging from it.
    pub fn remove(&mut self, branch: Branch, cut_node: Option<NodeId>) {
        if branch.is_null() {
            return;
        }
        let joining = self.find_joining_branch(branch);
        self.delete_branch(branch);
        if !joining.is_null() {
            self.delete_branch(Branch::new(joining.lower, branch.upper));
            self.delete_branch(Branch::new(branch.upper, joining.upper));
            self.insert_branch(joining);
        }
        if let Some(cut) = cut_node {
            self.insert_branch(Branch::new(branch.lower, cut));
        }
    }

    /// Graft `added` onto `joining`, splitting it at `added.upper`.
    pub fn add(&mut self, added: Branch, joining: Branch, cut_node: Option<NodeId>) {
        if added.is_null() {
            return;
        }
        if let Some(cut) = cut_node {
            let hanging = Branch::new(added.lower, cut);
            if self.contains_branch(&hanging) {
                self.delete_branch(hanging);
            }
        }
        if !joining.is_null() {
            self.delete_branch(joining);
            self.insert_branch(Branch::new(joining.lower, added.upper));
            self.insert_branch(Branch::new(added.upper, joining.upper));
        }
        self.insert_branch(added);
    }

    /// Log density of the coalescence times under the standard
    /// coalescent.
    pub fn prior_likelihood(&self, nodes: &Nodes) -> f64 {
        let counts = LineageCounts::new(self, nodes);
        let mut log_likelihood = 0.0;
        let mut prev = 0.0;
        for (i, &t) in counts.coalescences.iter().enumerate() {
            let k = counts.leaves.saturating_sub(i) as f64;
            if k >= 2.0 {
                log_likelihood -= k * (k - 1.0) / 2.0 * (t - prev);
            }
            prev = t;
        }
        log_likelihood
    }

    /// Log density of the SMC' transition through `r`, from this
    /// tree (the tree just before `r`).
    ///
    /// The break point is uniform along the tree and the floating
    /// lineage must escape coalescence until the inserted node.
    pub fn transition_likelihood(&self, nodes: &Nodes, r: &Recombination) -> f64 {
        let Some(q) = r.inserted_node() else {
            return 0.0;
        };
        let length = self.length(nodes);
        if r.source_branch().is_null() || length <= 0.0 {
            return 0.0;
        }
        let counts = LineageCounts::new(self, nodes);
        -length.ln() - counts.integrate(r.start_time(), nodes.time(q))
    }

    /// Log probability of the states at `pos`: one mutation on each
    /// disagreeing edge and none elsewhere.
    pub fn data_likelihood(&self, nodes: &Nodes, theta: f64, pos: Position) -> f64 {
        let mut log_likelihood = 0.0;
        for b in self.finite_branches() {
            if nodes.state(b.lower, pos) != nodes.state(b.upper, pos) {
                log_likelihood += (theta * Self::branch_length(nodes, &b)).ln();
            }
        }
        log_likelihood - theta * self.length(nodes)
    }

    /// Log probability of no mutation on the tree.
    pub fn null_likelihood(&self, nodes: &Nodes, theta: f64) -> f64 {
        -theta * self.length(nodes)
    }

    /// Write the states at `pos` implied by a mutation on each of
    /// `mapped`, top down from the root.
    pub fn impute_states(&self, nodes: &mut Nodes, pos: Position, mapped: &BranchSet) {
        let mut stack = vec![(NodeId::ROOT, nodes.state(NodeId::ROOT, pos))];
        while let Some((node, state)) = stack.pop() {
            for child in self.children(node) {
                let s = if mapped.contains(&Branch::new(child, node)) {
                    state ^ 1
                } else {
                    state
                };
                nodes.write_state(child, pos, s);
                stack.push((child, s));
            }
        }
    }
}

/// Number of lineages of a tree as a step function of time.
#[derive(Debug)]
pub(crate) struct LineageCounts {
    leaves: usize,
    coalescences: Vec<f64>,
}

impl LineageCounts {
    pub(crate) fn new(tree: &Tree, nodes: &Nodes) -> Self {
        let leaves = tree
            .parents
            .keys()
            .filter(|n| !tree.children.contains_key(*n))
            .count();
        let mut coalescences = tree
            .children
            .keys()
            .filter(|&&n| n != NodeId::ROOT)
            .map(|&n| nodes.time(n))
            .collect::<Vec<_>>();
        coalescences.sort_by(f64::total_cmp);
        Self {
            leaves,
            coalescences,
        }
    }

    pub(crate) fn count_at(&self, t: f64) -> usize {
        let merged = self.coalescences.partition_point(|&c| c <= t);
        self.leaves.saturating_sub(merged)
    }

    /// Times at which the count changes.
    pub(crate) fn breakpoints(&self) -> &[f64] {
        &self.coalescences
    }

    /// Integral of the count over `[a, b]`.
    pub(crate) fn integrate(&self, a: f64, b: f64) -> f64 {
        if b <= a {
            return 0.0;
        }
        let mut total = 0.0;
        let mut lo = a;
        for &c in &self.coalescences {
            if c <= lo {
                continue;
            }
            if c >= b {
                break;
            }
            total += self.count_at(lo) as f64 * (c - lo);
            lo = c;
        }
        total + self.count_at(lo) as f64 * (b - lo)
    }
}
