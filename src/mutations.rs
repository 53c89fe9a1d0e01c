use std::collections::BTreeMap;
use std::ops::Bound::Excluded;
use std::ops::Bound::Unbounded;

use tracing::trace;

use crate::arg::Arg;
use crate::fitch::FitchReconstruction;
use crate::node::Nodes;
use crate::tree::Tree;
use crate::Branch;
use crate::BranchSet;
use crate::Position;

// Edges of `tree` whose end points carry different states at `x`.
fn disagreeing_branches(tree: &Tree, nodes: &Nodes, x: Position) -> BranchSet {
    tree.branches()
        .into_iter()
        .filter(|b| nodes.state(b.lower, x) != nodes.state(b.upper, x))
        .collect()
}

fn last_at_or_before(branches: &BTreeMap<Position, Branch>, x: Position) -> Branch {
    branches
        .range(..=x)
        .next_back()
        .map(|(_, &b)| b)
        .unwrap_or_default()
}

impl Arg {
    fn assert_parity(&self, x: Position) {
        if let Some(mapped) = self.mutation_branches.get(&x) {
            for b in mapped {
                assert_ne!(
                    self.nodes.state(b.lower, x),
                    self.nodes.state(b.upper, x),
                    "{b:?} carries no state change at site {x}"
                );
            }
        }
    }

    /// Update the mapping at site `x` for `added` grafted onto
    /// `joining`. The new node takes the majority state of its
    /// three neighbours.
    pub(crate) fn map_mutation(&mut self, x: Position, joining: Branch, added: Branch) {
        let sl = self.nodes.state(joining.lower, x);
        let su = self.nodes.state(joining.upper, x);
        let s0 = self.nodes.state(added.lower, x);
        let sm = u8::from(sl + su + s0 > 1);
        self.nodes.write_state(added.upper, x, sm);
        let mapped = self.mutation_branches.entry(x).or_default();
        if sl != su {
            mapped.remove(&joining);
        }
        if sm != sl {
            mapped.insert(Branch::new(joining.lower, added.upper));
        }
        if sm != su {
            mapped.insert(Branch::new(added.upper, joining.upper));
        }
        if sm != s0 {
            mapped.insert(added);
        }
        self.assert_parity(x);
    }

    /// Rewrite the mapping of every site in the rewired span for the
    /// excision recorded in the removed and joining branches.
    pub(crate) fn remap_mutations(&mut self) {
        let (Some((&x, _)), Some((&y, _))) = (
            self.joining_branches.first_key_value(),
            self.joining_branches.last_key_value(),
        ) else {
            return;
        };
        let sites = self
            .mutation_branches
            .range(x..y)
            .map(|(&m, _)| m)
            .collect::<Vec<_>>();
        for m in sites {
            let removed = last_at_or_before(&self.removed_branches, m);
            let joining = last_at_or_before(&self.joining_branches, m);
            if removed.is_null() {
                continue;
            }
            let changed = !joining.is_null()
                && self.nodes.state(joining.lower, m) != self.nodes.state(joining.upper, m);
            let mapped = self.mutation_branches.entry(m).or_default();
            mapped.remove(&removed);
            if !joining.is_null() {
                mapped.remove(&Branch::new(joining.lower, removed.upper));
                mapped.remove(&Branch::new(removed.upper, joining.upper));
            }
            if changed {
                mapped.insert(joining);
            }
            self.assert_parity(m);
        }
        trace!(start = x.value(), end = y.value(), "remapped mutations");
    }

    /// Recompute the mapping of every site in `[x, y)` from the
    /// node states.
    pub fn map_mutations(&mut self, x: Position, y: Position) {
        let mut tree = self.get_tree_at(x);
        let sites = self
            .mutation_sites
            .range(x..y)
            .filter(|m| !m.is_end())
            .copied()
            .collect::<Vec<_>>();
        let mut events = self
            .recombinations
            .range((Excluded(x), Unbounded))
            .peekable();
        for m in sites {
            while let Some((_, r)) = events.next_if(|&(&pos, _)| pos <= m) {
                tree.forward_update(r);
            }
            let mapped = disagreeing_branches(&tree, &self.nodes, m);
            self.mutation_branches.insert(m, mapped);
        }
    }

    /// Map site `x` onto the edges of `tree` whose end points
    /// disagree.
    pub fn map_mutation_on_tree(&mut self, tree: &Tree, x: Position) {
        let mapped = disagreeing_branches(tree, &self.nodes, x);
        self.mutation_branches.insert(x, mapped);
    }

    /// Map the sites under newly grafted material. `added` and
    /// `joining` are keyed by the breakpoints at which they change.
    pub(crate) fn impute(
        &mut self,
        joining: &BTreeMap<Position, Branch>,
        added: &BTreeMap<Position, Branch>,
    ) {
        let mut joining_branch = Branch::null();
        for ((&pos, &added_branch), &next) in added.iter().zip(added.keys().skip(1)) {
            if let Some(&j) = joining.get(&pos) {
                joining_branch = j;
            }
            if added_branch.is_null() || joining_branch.is_null() {
                continue;
            }
            let sites = self
                .mutation_sites
                .range(pos..next)
                .copied()
                .collect::<Vec<_>>();
            for m in sites {
                self.map_mutation(m, joining_branch, added_branch);
            }
        }
    }

    /// Parsimony states for the internal nodes at every site in
    /// `[x, y)`.
    pub fn impute_nodes(&mut self, x: Position, y: Position) {
        let mut fitch = FitchReconstruction::new(self.get_tree_at(x));
        let sites = self
            .mutation_sites
            .range(x..y)
            .filter(|m| !m.is_end())
            .copied()
            .collect::<Vec<_>>();
        let mut events = self
            .recombinations
            .range((Excluded(x), Unbounded))
            .peekable();
        for m in sites {
            while let Some((_, r)) = events.next_if(|&(&pos, _)| pos <= m) {
                fitch.update(r);
            }
            fitch.reconstruct(&mut self.nodes, m);
        }
    }
}
