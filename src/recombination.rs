use std::collections::BTreeSet;

use crate::node::Nodes;
use crate::Branch;
use crate::BranchSet;
use crate::NodeId;
use crate::Position;

/// Bookkeeping derived from the branch sets of a recombination
/// and its source branch.
///
/// Under SMC' a lineage below `source_branch.upper` breaks off at
/// `start_time`, so that the node `deleted_node` disappears and
/// its other child joins its parent along `merging_branch`.
/// The floating lineage coalesces back into `target_branch`,
/// creating `inserted_node`. `recombined_branch` is the edge
/// from the source lineage to the inserted node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecombInfo {
    pub source_branch: Branch,
    pub deleted_node: Option<NodeId>,
    pub inserted_node: Option<NodeId>,
    pub target_branch: Branch,
    pub merging_branch: Branch,
    pub recombined_branch: Branch,
}

impl Default for RecombInfo {
    fn default() -> Self {
        Self {
            source_branch: Branch::null(),
            deleted_node: None,
            inserted_node: None,
            target_branch: Branch::null(),
            merging_branch: Branch::null(),
            recombined_branch: Branch::null(),
        }
    }
}

fn endpoints(branches: &BranchSet) -> BTreeSet<NodeId> {
    branches
        .iter()
        .flat_map(|b| [b.lower, b.upper])
        .filter(|&n| n != NodeId::ROOT)
        .collect()
}

// The single node in `a` that is absent from `b`, if there is exactly one.
fn lone_node(a: &BTreeSet<NodeId>, b: &BTreeSet<NodeId>) -> Option<NodeId> {
    let mut diff = a.difference(b);
    match (diff.next(), diff.next()) {
        (Some(&n), None) => Some(n),
        _ => None,
    }
}

fn candidates(deleted: &BranchSet, inserted: &BranchSet, p: NodeId, q: NodeId) -> Vec<Branch> {
    deleted
        .iter()
        .filter(|b| b.upper == p && inserted.contains(&Branch::new(b.lower, q)))
        .copied()
        .collect()
}

/// Derive the bookkeeping of an event from its branch sets.
///
/// `source_hint` is kept as the source branch whenever the sets
/// admit it. Otherwise the first admissible source is used.
/// Events that are not a single SMC' move (boundaries, or events
/// caught in the middle of a rewiring) yield partially or fully
/// unset bookkeeping.
pub fn derive_bookkeeping(
    deleted: &BranchSet,
    inserted: &BranchSet,
    source_hint: Branch,
) -> RecombInfo {
    let mut info = RecombInfo::default();
    let prev_nodes = endpoints(deleted);
    let next_nodes = endpoints(inserted);
    let (Some(p), Some(q)) = (
        lone_node(&prev_nodes, &next_nodes),
        lone_node(&next_nodes, &prev_nodes),
    ) else {
        return info;
    };
    info.deleted_node = Some(p);
    info.inserted_node = Some(q);

    let admissible = candidates(deleted, inserted, p, q);
    let source = if admissible.contains(&source_hint) {
        source_hint
    } else {
        match admissible.first() {
            Some(&b) => b,
            None => return info,
        }
    };
    info.source_branch = source;
    info.recombined_branch = Branch::new(source.lower, q);

    let sibling = deleted
        .iter()
        .find(|b| b.upper == p && b.lower != source.lower)
        .map(|b| b.lower);
    let grandparent = deleted.iter().find(|b| b.lower == p).map(|b| b.upper);
    if let (Some(s), Some(g)) = (sibling, grandparent) {
        info.merging_branch = Branch::new(s, g);
    }

    let target_lower = inserted
        .iter()
        .find(|b| b.upper == q && b.lower != source.lower)
        .map(|b| b.lower);
    let target_upper = inserted.iter().find(|b| b.lower == q).map(|b| b.upper);
    if let (Some(l), Some(u)) = (target_lower, target_upper) {
        info.target_branch = Branch::new(l, u);
    }
    info
}

// Edges leaving and entering a local tree when the lineage along
// `removed` is excised: its upper node disappears and the sibling
// joins the grandparent along `joining`. With a cut node, the
// lower node stays attached to it.
fn excision(removed: Branch, joining: Branch, cut: Option<NodeId>) -> (Vec<Branch>, Vec<Branch>) {
    let mut dropped = vec![];
    let mut gained = vec![];
    if removed.is_null() {
        return (dropped, gained);
    }
    dropped.push(removed);
    if !joining.is_null() {
        dropped.push(Branch::new(joining.lower, removed.upper));
        dropped.push(Branch::new(removed.upper, joining.upper));
        gained.push(joining);
    }
    if let Some(cut) = cut {
        gained.push(Branch::new(removed.lower, cut));
    }
    (dropped, gained)
}

fn split(region: Branch, node: NodeId, t: f64, nodes: &Nodes) -> Branch {
    if t < nodes.time(node) {
        Branch::new(region.lower, node)
    } else {
        Branch::new(node, region.upper)
    }
}

/// The change of the local tree at one genomic position.
#[derive(Clone, Debug, PartialEq)]
pub struct Recombination {
    pos: Position,
    start_time: f64,
    // Source lineage the start time refers to. It survives rewiring
    // steps that make it temporarily inadmissible.
    source_hint: Branch,
    deleted_branches: BranchSet,
    inserted_branches: BranchSet,
    info: RecombInfo,
}

impl Recombination {
    pub fn new(pos: Position, deleted_branches: BranchSet, inserted_branches: BranchSet) -> Self {
        let mut rv = Self {
            pos,
            start_time: 0.0,
            source_hint: Branch::null(),
            deleted_branches,
            inserted_branches,
            info: RecombInfo::default(),
        };
        rv.simplify_branches();
        rv.derive();
        rv
    }

    /// An event with no branch changes, used for the sequence boundaries.
    pub fn boundary(pos: Position) -> Self {
        Self::new(pos, BranchSet::new(), BranchSet::new())
    }

    pub fn pos(&self) -> Position {
        self.pos
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn deleted_branches(&self) -> &BranchSet {
        &self.deleted_branches
    }

    pub fn inserted_branches(&self) -> &BranchSet {
        &self.inserted_branches
    }

    pub fn info(&self) -> &RecombInfo {
        &self.info
    }

    pub fn source_branch(&self) -> Branch {
        self.info.source_branch
    }

    pub fn deleted_node(&self) -> Option<NodeId> {
        self.info.deleted_node
    }

    pub fn inserted_node(&self) -> Option<NodeId> {
        self.info.inserted_node
    }

    pub fn target_branch(&self) -> Branch {
        self.info.target_branch
    }

    pub fn merging_branch(&self) -> Branch {
        self.info.merging_branch
    }

    pub fn recombined_branch(&self) -> Branch {
        self.info.recombined_branch
    }

    pub fn is_empty(&self) -> bool {
        self.deleted_branches.is_empty() && self.inserted_branches.is_empty()
    }

    pub fn is_boundary(&self) -> bool {
        self.pos == Position::ZERO || self.pos.is_end()
    }

    pub fn affect(&self, branch: &Branch) -> bool {
        self.deleted_branches.contains(branch)
    }

    pub fn create(&self, branch: &Branch) -> bool {
        self.inserted_branches.contains(branch)
    }

    /// Set the primary fields and rederive everything else.
    pub fn set_source(&mut self, source_branch: Branch, start_time: f64) {
        self.start_time = start_time;
        self.source_hint = source_branch;
        self.derive();
    }

    /// Reconcile the source and start time once a rewiring is
    /// complete. A source that moved off the hinted lineage, or a
    /// start time outside `(t(source.lower), min(t(deleted), t(inserted))]`,
    /// leaves the start time unset for the samplers.
    pub(crate) fn settle_source(&mut self, nodes: &Nodes) {
        if self.is_boundary() {
            return;
        }
        let source = self.info.source_branch;
        if source != self.source_hint {
            self.source_hint = source;
            self.start_time = 0.0;
        }
        let (Some(p), Some(q)) = (self.info.deleted_node, self.info.inserted_node) else {
            return;
        };
        if source.is_null() {
            return;
        }
        let upper = nodes.time(p).min(nodes.time(q));
        if self.start_time <= nodes.time(source.lower) || self.start_time > upper {
            self.start_time = 0.0;
        }
    }

    /// Branches that could have carried the recombination:
    /// children of the deleted node that reattach to the
    /// inserted node.
    pub fn source_candidates(&self) -> Vec<Branch> {
        match (self.info.deleted_node, self.info.inserted_node) {
            (Some(p), Some(q)) => candidates(&self.deleted_branches, &self.inserted_branches, p, q),
            _ => vec![],
        }
    }

    fn derive(&mut self) {
        self.info = derive_bookkeeping(
            &self.deleted_branches,
            &self.inserted_branches,
            self.source_hint,
        );
    }

    fn simplify_branches(&mut self) {
        let common = self
            .deleted_branches
            .intersection(&self.inserted_branches)
            .copied()
            .collect::<Vec<_>>();
        for b in common {
            self.deleted_branches.remove(&b);
            self.inserted_branches.remove(&b);
        }
    }

    /// Where a point at time `t` on `branch`, in the tree just
    /// before this event, sits in the tree just after it.
    /// The null branch means the point no longer exists.
    pub fn trace_forward(&self, nodes: &Nodes, t: f64, branch: Branch) -> Branch {
        if branch.is_null() || self.pos.is_end() {
            return Branch::null();
        }
        if !self.affect(&branch) {
            return branch;
        }
        let info = &self.info;
        let (Some(p), Some(q)) = (info.deleted_node, info.inserted_node) else {
            return Branch::null();
        };
        if branch == info.source_branch {
            return if t < self.start_time {
                info.recombined_branch
            } else {
                Branch::null()
            };
        }
        let region = if branch == info.target_branch {
            info.target_branch
        } else if branch.upper == p || branch.lower == p {
            info.merging_branch
        } else {
            return Branch::null();
        };
        if region.is_null() {
            Branch::null()
        } else if region == info.target_branch {
            split(region, q, t, nodes)
        } else {
            region
        }
    }

    /// Inverse of [`Recombination::trace_forward`].
    pub fn trace_backward(&self, nodes: &Nodes, t: f64, branch: Branch) -> Branch {
        if branch.is_null() || self.pos == Position::ZERO {
            return Branch::null();
        }
        if !self.create(&branch) {
            return branch;
        }
        let info = &self.info;
        let (Some(p), Some(q)) = (info.deleted_node, info.inserted_node) else {
            return Branch::null();
        };
        if branch == info.recombined_branch {
            return if t < self.start_time {
                info.source_branch
            } else {
                Branch::null()
            };
        }
        let region = if branch.upper == q || branch.lower == q {
            info.target_branch
        } else if branch == info.merging_branch {
            info.merging_branch
        } else {
            return Branch::null();
        };
        if region.is_null() {
            Branch::null()
        } else if region == info.merging_branch {
            split(region, p, t, nodes)
        } else {
            region
        }
    }

    /// Rewrite the event so that it describes the trees with a
    /// lineage excised on both sides of it.
    ///
    /// `prev_*` describe the tree just before the event and
    /// `next_*` the tree just after it. A null removed branch
    /// leaves that side untouched.
    pub fn remove(
        &mut self,
        prev_removed_branch: Branch,
        next_removed_branch: Branch,
        prev_joining_branch: Branch,
        next_joining_branch: Branch,
        cut_node: Option<NodeId>,
    ) {
        // a source split by the excised node continues along the
        // joining branch
        if !prev_removed_branch.is_null() && !prev_joining_branch.is_null() {
            let node = prev_removed_branch.upper;
            if self.source_hint == Branch::new(prev_joining_branch.lower, node)
                || self.source_hint == Branch::new(node, prev_joining_branch.upper)
            {
                self.source_hint = prev_joining_branch;
            }
        }
        let (before_out, before_in) = excision(prev_removed_branch, prev_joining_branch, cut_node);
        let (after_out, after_in) = excision(next_removed_branch, next_joining_branch, cut_node);
        self.rewire(&before_out, &before_in, &after_out, &after_in);
    }

    /// Rewrite the event so that it describes the trees with a
    /// lineage grafted onto the joining branches on both sides.
    pub fn add(
        &mut self,
        prev_added_branch: Branch,
        next_added_branch: Branch,
        prev_joining_branch: Branch,
        next_joining_branch: Branch,
        cut_node: Option<NodeId>,
    ) {
        // Grafting is an excision run backwards.
        let (before_in, before_out) = excision(prev_added_branch, prev_joining_branch, cut_node);
        let (after_in, after_out) = excision(next_added_branch, next_joining_branch, cut_node);
        self.rewire(&before_out, &before_in, &after_out, &after_in);

        // a source split by the grafted node continues along the
        // half that can still carry the recombination
        if !prev_added_branch.is_null() && self.source_hint == prev_joining_branch {
            let node = prev_added_branch.upper;
            let halves = [
                Branch::new(node, prev_joining_branch.upper),
                Branch::new(prev_joining_branch.lower, node),
            ];
            let admissible = self.source_candidates();
            if let Some(&half) = halves.iter().find(|h| admissible.contains(h)) {
                self.source_hint = half;
                self.derive();
            }
        }
    }

    // Recompute the branch sets after the tree before the event
    // loses `before_out` and gains `before_in`, and the tree after
    // it loses `after_out` and gains `after_in`.
    //
    // Membership of an edge in the two adjacent trees is recovered
    // from the current sets: dropped edges are known to be present
    // and gained edges known to be absent.
    fn rewire(
        &mut self,
        before_out: &[Branch],
        before_in: &[Branch],
        after_out: &[Branch],
        after_in: &[Branch],
    ) {
        let mut touched = BranchSet::new();
        touched.extend(self.deleted_branches.iter().copied());
        touched.extend(self.inserted_branches.iter().copied());
        for b in before_out.iter().chain(before_in).chain(after_out).chain(after_in) {
            touched.insert(*b);
        }

        let mut deleted = BranchSet::new();
        let mut inserted = BranchSet::new();
        for e in touched {
            let dropped = before_out.contains(&e) || after_out.contains(&e);
            let in_before = self.deleted_branches.contains(&e)
                || (!self.inserted_branches.contains(&e) && dropped);
            let in_after = self.inserted_branches.contains(&e)
                || (!self.deleted_branches.contains(&e) && dropped);
            let new_before = (in_before && !before_out.contains(&e)) || before_in.contains(&e);
            let new_after = (in_after && !after_out.contains(&e)) || after_in.contains(&e);
            match (new_before, new_after) {
                (true, false) => {
                    deleted.insert(e);
                }
                (false, true) => {
                    inserted.insert(e);
                }
                _ => (),
            }
        }
        self.deleted_branches = deleted;
        self.inserted_branches = inserted;
        self.derive();
    }
}

#[cfg(test)]
mod test_recombination {
    use super::*;
    use crate::node::Node;

    fn n(i: usize) -> NodeId {
        NodeId::new(i)
    }

    fn b(lower: usize, upper: usize) -> Branch {
        Branch::new(n(lower), n(upper))
    }

    fn set(branches: &[Branch]) -> BranchSet {
        branches.iter().copied().collect()
    }

    fn nodes() -> Nodes {
        let mut nodes = Nodes::new();
        for t in [0.0, 0.0, 0.0, 1.0, 2.0, 1.5] {
            nodes.push(Node::new(t));
        }
        nodes
    }

    // Before (tree at x < 50):   After (tree at x >= 50):
    //
    //        4                        4
    //      -----                    -----
    //      3   |                    |   5
    //     ---  |                    |  ---
    //     0 1  2                    1  0 2
    //
    // 0 breaks off (0, 3) and coalesces onto (2, 4) at node 5.
    fn event() -> Recombination {
        let mut r = Recombination::new(
            Position::new(50.0),
            set(&[b(0, 3), b(1, 3), b(3, 4), b(2, 4)]),
            set(&[b(1, 4), b(0, 5), b(2, 5), b(5, 4)]),
        );
        r.set_source(b(0, 3), 0.5);
        r
    }

    #[test]
    fn test_derived_bookkeeping() {
        let r = event();
        assert_eq!(r.deleted_node(), Some(n(3)));
        assert_eq!(r.inserted_node(), Some(n(5)));
        assert_eq!(r.source_branch(), b(0, 3));
        assert_eq!(r.recombined_branch(), b(0, 5));
        assert_eq!(r.merging_branch(), b(1, 4));
        assert_eq!(r.target_branch(), b(2, 4));
        assert_eq!(r.source_candidates(), vec![b(0, 3)]);
    }

    #[test]
    fn test_simplify_common_branches() {
        let r = Recombination::new(
            Position::new(10.0),
            set(&[b(0, 3), b(2, 4)]),
            set(&[b(0, 4), b(2, 4)]),
        );
        assert_eq!(r.deleted_branches(), &set(&[b(0, 3)]));
        assert_eq!(r.inserted_branches(), &set(&[b(0, 4)]));
    }

    #[test]
    fn test_trace_forward() {
        let nodes = nodes();
        let r = event();
        // below the recombination point the lineage follows node 0
        assert_eq!(r.trace_forward(&nodes, 0.25, b(0, 3)), b(0, 5));
        // above it the lineage is gone
        assert!(r.trace_forward(&nodes, 0.75, b(0, 3)).is_null());
        assert_eq!(r.trace_forward(&nodes, 0.5, b(1, 3)), b(1, 4));
        assert_eq!(r.trace_forward(&nodes, 1.5, b(3, 4)), b(1, 4));
        assert_eq!(r.trace_forward(&nodes, 1.0, b(2, 4)), b(2, 5));
        assert_eq!(r.trace_forward(&nodes, 1.75, b(2, 4)), b(5, 4));
        // untouched branches pass through
        let root_branch = Branch::new(n(4), NodeId::ROOT);
        assert_eq!(r.trace_forward(&nodes, 3.0, root_branch), root_branch);
    }

    #[test]
    fn test_trace_backward() {
        let nodes = nodes();
        let r = event();
        assert_eq!(r.trace_backward(&nodes, 0.25, b(0, 5)), b(0, 3));
        assert!(r.trace_backward(&nodes, 1.0, b(0, 5)).is_null());
        assert_eq!(r.trace_backward(&nodes, 1.0, b(2, 5)), b(2, 4));
        assert_eq!(r.trace_backward(&nodes, 1.75, b(5, 4)), b(2, 4));
        assert_eq!(r.trace_backward(&nodes, 0.5, b(1, 4)), b(1, 3));
        assert_eq!(r.trace_backward(&nodes, 1.5, b(1, 4)), b(3, 4));
    }

    #[test]
    fn test_boundaries_trace_to_null() {
        let nodes = nodes();
        let start = Recombination::new(
            Position::ZERO,
            BranchSet::new(),
            set(&[b(0, 3), b(1, 3)]),
        );
        assert!(start.trace_backward(&nodes, 0.5, b(0, 3)).is_null());
        let end = Recombination::boundary(Position::END);
        assert!(end.trace_forward(&nodes, 0.5, b(0, 3)).is_null());
        assert!(end.is_boundary());
        assert!(end.is_empty());
    }

    #[test]
    fn test_remove_below_recombination_is_vacuous() {
        // Cutting lineage 0 below the recombination point removes the
        // whole event: both sides collapse to the same tree.
        let mut r = event();
        r.remove(b(0, 3), b(0, 5), b(1, 4), b(2, 4), Some(NodeId::CUT));
        assert!(r.is_empty());
    }

    #[test]
    fn test_remove_then_add_restores_event() {
        let original = event();
        let mut r = original.clone();
        // Lineage 2 is excised on both sides.
        let joining = Branch::new(n(3), NodeId::ROOT);
        r.remove(b(2, 4), b(2, 5), joining, b(0, 4), None);
        assert_eq!(r.deleted_branches(), &set(&[b(0, 3), b(1, 3), joining]));
        assert_eq!(
            r.inserted_branches(),
            &set(&[b(1, 4), b(0, 4), Branch::new(n(4), NodeId::ROOT)])
        );
        r.add(b(2, 4), b(2, 5), joining, b(0, 4), None);
        assert_eq!(r.deleted_branches(), original.deleted_branches());
        assert_eq!(r.inserted_branches(), original.inserted_branches());
        assert_eq!(r.source_branch(), original.source_branch());
    }

    #[test]
    fn test_source_follows_grafted_lineage() {
        let mut nodes = nodes();
        let graft = nodes.push(Node::new(0.25));
        let lone = nodes.push(Node::new(0.0));
        let added = Branch::new(lone, graft);
        let mut r = event();
        // a node above 0 at 0.25 on (0, 3) before and on (0, 5) after
        r.add(added, added, b(0, 3), b(0, 5), None);
        assert_eq!(r.source_branch(), Branch::new(graft, n(3)));
        assert_eq!(r.recombined_branch(), Branch::new(graft, n(5)));
        r.settle_source(&nodes);
        assert_eq!(r.start_time(), 0.5);

        // the same graft above the start time leaves no lineage to
        // carry it
        nodes[graft] = Node::new(0.75);
        let mut r = event();
        r.add(added, added, b(0, 3), b(0, 5), None);
        r.settle_source(&nodes);
        assert_eq!(r.source_branch(), Branch::new(graft, n(3)));
        assert_eq!(r.start_time(), 0.0);
    }

    #[test]
    fn test_source_survives_merge_and_split() {
        let nodes = nodes();
        let original = event();
        let mut r = original.clone();
        // excising 1 merges (0, 3) and (3, 4) before the event and
        // (5, 4) and (4, root) after it
        let cut = Some(NodeId::CUT);
        let root = Branch::new(n(5), NodeId::ROOT);
        r.remove(b(1, 3), b(1, 4), b(0, 4), root, cut);
        assert_eq!(r.deleted_node(), Some(n(4)));
        assert_eq!(r.source_branch(), b(0, 4));
        r.add(b(1, 3), b(1, 4), b(0, 4), root, cut);
        r.settle_source(&nodes);
        assert_eq!(r, original);
    }

    #[test]
    fn test_add_onto_empty_event_builds_breakpoint() {
        let mut r = Recombination::boundary(Position::new(30.0));
        r.add(b(2, 5), b(2, 6), b(0, 4), b(1, 4), None);
        assert_eq!(
            r.deleted_branches(),
            &set(&[b(2, 5), b(0, 5), b(5, 4), b(1, 4)])
        );
        assert_eq!(
            r.inserted_branches(),
            &set(&[b(2, 6), b(1, 6), b(6, 4), b(0, 4)])
        );
    }
}
