use std::collections::BTreeMap;
use std::ops::Bound::Excluded;
use std::ops::Bound::Unbounded;

use tracing::debug;
use tracing::trace;

use crate::arg::Arg;
use crate::cut::CutPoint;
use crate::node::Nodes;
use crate::recombination::Recombination;
use crate::tree::Tree;
use crate::Branch;
use crate::NodeId;
use crate::Position;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn advance(self, tree: &mut Tree, r: &Recombination) {
        match self {
            Direction::Forward => tree.forward_update(r),
            Direction::Backward => tree.backward_update(r),
        }
    }

    fn retreat(self, tree: &mut Tree, r: &Recombination) {
        match self {
            Direction::Forward => tree.backward_update(r),
            Direction::Backward => tree.forward_update(r),
        }
    }

    fn trace(self, r: &Recombination, nodes: &Nodes, t: f64, branch: Branch) -> Branch {
        match self {
            Direction::Forward => r.trace_forward(nodes, t, branch),
            Direction::Backward => r.trace_backward(nodes, t, branch),
        }
    }
}

// Removed and joining branch in effect from one breakpoint on.
#[derive(Debug)]
struct ScanRecord {
    pos: Position,
    removed: Branch,
    joining: Branch,
}

// Follow the detached lineage from the cut outwards, excising it
// from every event it crosses.
//
// `tree` starts as the intact tree at the cut position and ends as
// the intact tree at the last breakpoint reached.
#[allow(clippy::too_many_arguments)]
fn scan<'a, I>(
    events: I,
    direction: Direction,
    tree: &mut Tree,
    nodes: &Nodes,
    center: Branch,
    t: f64,
    cut_node: NodeId,
    sequence_end: Position,
) -> Vec<ScanRecord>
where
    I: Iterator<Item = (&'a Position, &'a mut Recombination)>,
{
    let mut records = vec![];
    let mut current = center;
    for (&pos, r) in events {
        let joining = tree.find_joining_branch(current);
        if pos.is_end() {
            records.push(ScanRecord {
                pos: sequence_end,
                removed: Branch::null(),
                joining: Branch::null(),
            });
            break;
        }
        direction.advance(tree, r);
        let mut traced = direction.trace(r, nodes, t, current);
        if traced.is_root_branch() {
            traced = Branch::null();
        }
        if direction == Direction::Backward && traced.is_null() {
            direction.retreat(tree, r);
        }
        let traced_joining = tree.find_joining_branch(traced);
        match direction {
            Direction::Forward => {
                r.remove(current, traced, joining, traced_joining, Some(cut_node));
                records.push(ScanRecord {
                    pos: pos.min(sequence_end),
                    removed: traced,
                    joining: traced_joining,
                });
            }
            Direction::Backward => {
                r.remove(traced, current, traced_joining, joining, Some(cut_node));
                records.push(ScanRecord {
                    pos,
                    removed: current,
                    joining,
                });
            }
        }
        current = traced;
        if current.is_null() {
            break;
        }
    }
    records
}

impl Arg {
    /// Detach the lineage below `cut.branch` at `cut.time` over the
    /// span in which it can be traced from `cut.pos`.
    ///
    /// The lineage is left hanging from [`NodeId::CUT`]. Afterwards
    /// [`Arg::removed_branches`] and [`Arg::joining_branches`] hold,
    /// for every breakpoint of `[start, end]`, the branch that was
    /// removed and the branch its sibling now forms.
    pub fn remove(&mut self, cut: CutPoint) {
        let CutPoint {
            pos,
            branch: center,
            time: t,
        } = cut;
        let mut cut_tree = match self.cut_tree.take() {
            Some(tree) if self.cut_pos == pos => tree,
            _ => self.get_tree_at(pos),
        };
        assert!(
            cut_tree.contains_branch(&center),
            "{center:?} is not in the tree at {pos}"
        );
        self.cut_pos = pos;
        self.cut_time = t;
        let cut_node = self.nodes.set_cut(t);
        self.cut_node = Some(cut_node);
        self.removed_branches.clear();
        self.joining_branches.clear();

        let sequence_end = self.length_pos();
        let mut forward_tree = cut_tree.clone();
        let forward = scan(
            self.recombinations.range_mut((Excluded(pos), Unbounded)),
            Direction::Forward,
            &mut forward_tree,
            &self.nodes,
            center,
            t,
            cut_node,
            sequence_end,
        );
        let mut backward_tree = cut_tree.clone();
        let backward = scan(
            self.recombinations.range_mut(..=pos).rev(),
            Direction::Backward,
            &mut backward_tree,
            &self.nodes,
            center,
            t,
            cut_node,
            sequence_end,
        );
        for record in forward.into_iter().chain(backward) {
            self.removed_branches.insert(record.pos, record.removed);
            self.joining_branches.insert(record.pos, record.joining);
        }
        self.set_span_from_removed();
        debug!(
            start = self.start.value(),
            end = self.end.value(),
            breakpoints = self.removed_branches.len(),
            "removed lineage"
        );

        self.remove_empty_recombinations();
        self.remap_mutations();
        cut_tree.remove(center, Some(cut_node));
        self.cut_tree = Some(cut_tree);
        let first_removed = self
            .removed_branches
            .get(&self.start)
            .copied()
            .unwrap_or_default();
        backward_tree.remove(first_removed, Some(cut_node));
        self.start_tree = backward_tree;
        self.end_tree = forward_tree;
    }

    /// Detach the lineages given per breakpoint by `seeds`, from the
    /// first seed to the end of the sequence.
    ///
    /// Unlike [`Arg::remove`] the removed branches are not traced and
    /// the detached lineages are not attached to a cut node.
    pub fn remove_lineages(&mut self, seeds: &BTreeMap<Position, Branch>) {
        let Some((&start, _)) = seeds.first_key_value() else {
            return;
        };
        let end = self.length_pos();
        self.removed_branches.clear();
        self.joining_branches.clear();
        let mut tree = self.get_tree_before(start);
        let mut prev_removed = Branch::null();
        let mut prev_joining = Branch::null();
        for (&pos, r) in self.recombinations.range_mut(start..end) {
            let next_removed = seeds
                .range(..=pos)
                .next_back()
                .map(|(_, &b)| b)
                .unwrap_or_default();
            tree.forward_update(r);
            let next_joining = tree.find_joining_branch(next_removed);
            r.remove(prev_removed, next_removed, prev_joining, next_joining, None);
            self.removed_branches.insert(pos, next_removed);
            self.joining_branches.insert(pos, next_joining);
            prev_removed = next_removed;
            prev_joining = next_joining;
        }
        self.removed_branches.insert(end, prev_removed);
        self.joining_branches.insert(end, prev_joining);
        self.set_span_from_removed();
        debug!(
            start = self.start.value(),
            breakpoints = self.removed_branches.len(),
            "removed seeded lineages"
        );
        self.remove_empty_recombinations();
        self.remap_mutations();
    }

    /// Detach sample `index` over the whole sequence.
    pub fn remove_leaf(&mut self, index: usize) {
        let s = NodeId::new(index);
        assert!(self.sample_nodes.contains(&s), "{s:?} is not a sample");
        let mut tree = Tree::new();
        let mut seeds = BTreeMap::new();
        for (&pos, r) in self.recombinations.range(..self.length_pos()) {
            tree.forward_update(r);
            if let Some(parent) = tree.parent(s) {
                seeds.insert(pos, Branch::new(s, parent));
            }
        }
        self.remove_lineages(&seeds);
        self.start_tree = self.get_tree_at(Position::ZERO);
    }

    fn set_span_from_removed(&mut self) {
        if let (Some((&start, _)), Some((&end, _))) = (
            self.removed_branches.first_key_value(),
            self.removed_branches.last_key_value(),
        ) {
            self.start = start;
            self.end = end;
        }
    }

    /// Graft new material into `[start, end]`: at each key of
    /// `added`, the branch carrying the lineage and, at each key of
    /// `joining`, the branch it splits.
    pub fn add(
        &mut self,
        joining: &BTreeMap<Position, Branch>,
        added: &BTreeMap<Position, Branch>,
    ) {
        let cut_node = self.cut_node;
        let mut prev_added = Branch::null();
        let mut prev_joining = Branch::null();
        let mut next_joining = Branch::null();
        for (&pos, &next_added) in added.range(..self.length_pos()) {
            if let Some(&j) = joining.get(&pos) {
                next_joining = j;
            }
            if let Some(r) = self.recombinations.get_mut(&pos) {
                r.add(prev_added, next_added, prev_joining, next_joining, cut_node);
                r.settle_source(&self.nodes);
            } else {
                self.new_recombination(pos, prev_added, prev_joining, next_added, next_joining);
            }
            prev_added = next_added;
            prev_joining = next_joining;
        }
        debug!(breakpoints = added.len(), "added lineage");
        self.remove_empty_recombinations();
        self.impute(joining, added);
        if let (Some((_, &a)), Some((_, &j))) = (added.first_key_value(), joining.first_key_value()) {
            self.start_tree.add(a, j, cut_node);
        }
    }

    fn new_recombination(
        &mut self,
        pos: Position,
        prev_added: Branch,
        prev_joining: Branch,
        next_added: Branch,
        next_joining: Branch,
    ) {
        let mut r = Recombination::boundary(pos);
        r.add(prev_added, next_added, prev_joining, next_joining, self.cut_node);
        r.settle_source(&self.nodes);
        trace!(pos = pos.value(), "new breakpoint");
        self.recombinations.insert(pos, r);
    }

    /// Drop events of `[start, end]` that no longer change the tree.
    /// The boundary events are kept.
    pub(crate) fn remove_empty_recombinations(&mut self) {
        let (start, end) = (self.start, self.end);
        let before = self.recombinations.len();
        self.recombinations
            .retain(|&pos, r| pos < start || pos > end || r.is_boundary() || !r.is_empty());
        trace!(
            pruned = before - self.recombinations.len(),
            "removed empty recombinations"
        );
    }
}

#[cfg(test)]
mod test_rewire {
    use super::*;
    use crate::arg_fixtures::two_tree_arg;
    use crate::arg_fixtures::two_tree_trees;
    use crate::BranchSet;

    fn n(i: usize) -> NodeId {
        NodeId::new(i)
    }

    fn b(lower: usize, upper: usize) -> Branch {
        Branch::new(n(lower), n(upper))
    }

    // Cut (0, 3) at time 0.25, below the recombination at 50 that
    // moves node 0, so the lineage is traced through it and lost
    // at 75 where its upper end is no longer above node 0.
    fn cut() -> CutPoint {
        CutPoint {
            pos: Position::new(10.0),
            branch: b(0, 3),
            time: 0.25,
        }
    }

    #[test]
    fn test_remove_span() {
        let mut arg = two_tree_arg();
        arg.remove(cut());
        assert_eq!(arg.start(), Position::ZERO);
        assert_eq!(arg.end(), Position::new(100.0));
        assert_eq!(arg.cut_node(), Some(NodeId::CUT));
        let removed = arg.removed_branches();
        assert_eq!(removed[&Position::ZERO], b(0, 3));
        assert_eq!(removed[&Position::new(50.0)], b(0, 5));
        assert!(removed[&Position::new(100.0)].is_null());
        let joining = arg.joining_branches();
        assert_eq!(joining[&Position::ZERO], b(1, 4));
        assert_eq!(joining[&Position::new(50.0)], b(2, 4));
        assert_eq!(arg.get_updated_length(), 100.0);
        assert_eq!(arg.get_query_node_at(Position::new(60.0)), Some(n(0)));
    }

    #[test]
    fn test_remove_prunes_vacuous_breakpoint() {
        let mut arg = two_tree_arg();
        arg.remove(cut());
        // with 0 excised the trees on both sides of 50 agree
        assert!(!arg.recombinations().contains_key(&Position::new(50.0)));
        assert!(arg.recombinations().contains_key(&Position::new(75.0)));
        let hanging = Branch::new(n(0), NodeId::CUT);
        for x in [5.0, 60.0, 90.0] {
            let tree = arg.get_tree_at(Position::new(x));
            assert!(tree.contains_branch(&hanging), "at {x}");
            assert_eq!(tree.parent(n(1)), Some(n(if x < 75.0 { 4 } else { 6 })));
        }
        assert!(arg.start_tree() == &arg.get_tree_at(Position::ZERO));
        assert!(arg.end_tree() == &two_tree_trees()[2]);
    }

    #[test]
    fn test_remove_remaps_mutations() {
        let mut arg = two_tree_arg();
        arg.remove(cut());
        // (3, 4) has become (1, 4) at 20
        assert_eq!(
            arg.mutation_branches()[&Position::new(20.0)],
            [b(1, 4)].into_iter().collect::<BranchSet>()
        );
        // (2, 5) has become (2, 4) at 70
        assert_eq!(
            arg.mutation_branches()[&Position::new(70.0)],
            [b(2, 4)].into_iter().collect::<BranchSet>()
        );
    }

    #[test]
    fn test_remove_then_add_restores_trees() {
        let original = two_tree_arg();
        let mut arg = two_tree_arg();
        arg.remove(cut());
        let joining = arg.joining_branches().clone();
        let removed = arg.removed_branches().clone();
        arg.add(&joining, &removed);
        arg.clear_remove_info();
        for x in [0.0, 20.0, 50.0, 60.0, 75.0, 80.0] {
            let x = Position::new(x);
            assert!(arg.get_tree_at(x) == original.get_tree_at(x), "tree at {x}");
        }
        assert_eq!(arg.mutation_branches(), original.mutation_branches());
        assert!(arg.start_tree() == &original.get_tree_at(Position::ZERO));
        assert!(!arg.nodes().has_cut());
    }

    #[test]
    fn test_remove_then_add_restores_every_cut() {
        let original = two_tree_arg();
        let positions = [0.0, 20.0, 50.0, 60.0, 75.0, 80.0, 99.0].map(Position::new);
        for x in [10.0, 60.0, 80.0].map(Position::new) {
            let branches = original
                .get_tree_at(x)
                .branches()
                .into_iter()
                .filter(|b| !b.is_root_branch())
                .collect::<Vec<_>>();
            for branch in branches {
                let lower = original.nodes().time(branch.lower);
                let upper = original.nodes().time(branch.upper);
                for f in [0.15, 0.35, 0.55, 0.8, 0.95] {
                    let time = lower + f * (upper - lower);
                    let mut arg = two_tree_arg();
                    arg.remove(CutPoint { pos: x, branch, time });
                    let kept = arg.recombinations().keys().copied().collect::<Vec<_>>();
                    let joining = arg.joining_branches().clone();
                    let removed = arg.removed_branches().clone();
                    arg.add(&joining, &removed);
                    arg.clear_remove_info();
                    let label = format!("{branch:?} at {x}, t = {time}");
                    for y in positions {
                        assert!(arg.get_tree_at(y) == original.get_tree_at(y), "{label}: tree at {y}");
                    }
                    assert_eq!(arg.mutation_branches(), original.mutation_branches(), "{label}");
                    for pos in kept {
                        let (r, expected) = (&arg.recombinations()[&pos], &original.recombinations()[&pos]);
                        assert_eq!(r.source_branch(), expected.source_branch(), "{label}: event at {pos}");
                        assert_eq!(r.start_time(), expected.start_time(), "{label}: event at {pos}");
                    }
                }
            }
        }
    }

    // A new sample 7 grafted above sample 1 at 0.9, below the start
    // time of the recombination at 75 whose source is (1, 4).
    #[test]
    fn test_add_moves_source_onto_grafted_node() {
        let mut arg = two_tree_arg();
        let s = arg.new_node(0.0);
        arg.add_sample(s);
        let m = arg.new_node(0.9);
        let grafted = Branch::new(s, m);
        let end = Position::new(100.0);
        let joining = BTreeMap::from([
            (Position::ZERO, b(1, 3)),
            (Position::new(50.0), b(1, 4)),
            (Position::new(75.0), b(1, 6)),
            (end, Branch::null()),
        ]);
        let added = BTreeMap::from([
            (Position::ZERO, grafted),
            (Position::new(50.0), grafted),
            (Position::new(75.0), grafted),
            (end, Branch::null()),
        ]);
        arg.add(&joining, &added);
        arg.clear_remove_info();

        let r = &arg.recombinations()[&Position::new(75.0)];
        assert_eq!(r.source_branch(), Branch::new(m, n(4)));
        assert_eq!(r.recombined_branch(), Branch::new(m, n(6)));
        assert_eq!(r.start_time(), 1.2);
        let r = &arg.recombinations()[&Position::new(50.0)];
        assert_eq!(r.source_branch(), b(0, 3));
        assert_eq!(r.start_time(), 0.5);

        let tree = arg.get_tree_at(Position::new(80.0));
        assert_eq!(tree.parent(s), Some(m));
        assert_eq!(tree.parent(n(1)), Some(m));
        assert_eq!(tree.parent(m), Some(n(6)));
        assert_eq!(
            arg.mutation_branches()[&Position::new(20.0)],
            BranchSet::from([b(3, 4), grafted])
        );
    }

    #[test]
    fn test_remove_leaf() {
        let mut arg = two_tree_arg();
        arg.remove_leaf(2);
        assert_eq!(arg.start(), Position::ZERO);
        assert_eq!(arg.end(), Position::new(100.0));
        for x in [10.0, 60.0, 90.0] {
            let tree = arg.get_tree_at(Position::new(x));
            assert_eq!(tree.parent(n(2)), None, "at {x}");
            assert_eq!(tree.num_branches(), 3, "at {x}");
        }
        assert!(arg.mutation_branches()[&Position::new(70.0)].is_empty());
        assert_eq!(
            arg.mutation_branches()[&Position::new(20.0)],
            [Branch::new(n(3), NodeId::ROOT)].into_iter().collect::<BranchSet>()
        );
    }

    // A two-sample graph with one recombination at 50 and one
    // mutation at 20, carried by sample 0.
    #[test]
    fn test_two_sample_threading() {
        let mut arg = Arg::with_seed(1.0, 100.0, 3);
        let s1 = arg.new_node(0.0);
        let s2 = arg.new_node(0.0);
        let n1 = arg.new_node(1.0);
        let n2 = arg.new_node(2.0);
        let x = Position::new(20.0);
        arg.nodes.write_state(s1, x, 1);
        arg.build_singleton_arg(s1);
        arg.add_sample(s2);

        let end = Position::new(100.0);
        let joining = BTreeMap::from([
            (Position::ZERO, Branch::new(s1, NodeId::ROOT)),
            (end, Branch::null()),
        ]);
        let added = BTreeMap::from([
            (Position::ZERO, Branch::new(s2, n1)),
            (Position::new(50.0), Branch::new(s2, n2)),
            (end, Branch::null()),
        ]);
        arg.add(&joining, &added);
        arg.clear_remove_info();

        let before = arg.get_tree_at(x);
        let after = arg.get_tree_at(Position::new(80.0));
        assert_eq!(before.parent(s2), Some(n1));
        assert_eq!(after.parent(s2), Some(n2));
        let r = &arg.recombinations()[&Position::new(50.0)];
        assert_eq!(r.deleted_node(), Some(n1));
        assert_eq!(r.inserted_node(), Some(n2));
        assert!(after.contains_branch(&r.recombined_branch()));
        assert!(!before.contains_branch(&r.recombined_branch()));
        assert_eq!(arg.mutation_branches()[&x].len(), 1);
        assert_eq!(arg.mutation_branches()[&x], BranchSet::from([Branch::new(s1, n1)]));
        assert_eq!(arg.count_incompatibility(), 0);
        assert!(arg.start_tree() == &arg.get_tree_at(Position::ZERO));
    }
}
