use std::ops::Bound::Excluded;
use std::ops::Bound::Unbounded;

use rand::Rng;
use tracing::debug;

use crate::arg::Arg;
use crate::tree::Tree;
use crate::Branch;
use crate::Position;

// Proposals landing on a node time are redrawn at most this often.
const MAX_CUT_ATTEMPTS: usize = 1000;

/// Where a lineage is detached: a branch of the tree at `pos`, cut
/// at `time`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CutPoint {
    pub pos: Position,
    pub branch: Branch,
    pub time: f64,
}

impl Arg {
    fn set_cut_tree(&mut self, pos: Position, tree: Tree) {
        self.cut_pos = pos;
        self.cut_tree = Some(tree);
    }

    /// A point drawn uniformly on the tree at the end of the last
    /// rewired span, or on the first tree once the span reached the
    /// end of the sequence.
    ///
    /// # Panics
    ///
    /// If every draw lands on a node time.
    pub fn sample_internal_cut(&mut self) -> Option<CutPoint> {
        let at_start = self.end.value() >= self.sequence_length - 0.1;
        let pos = if at_start { Position::ZERO } else { self.end };
        let first_tree = at_start.then(|| self.get_tree_at(Position::ZERO));
        let tree = first_tree.as_ref().unwrap_or(&self.end_tree);
        let mut drawn = None;
        for _ in 0..MAX_CUT_ATTEMPTS {
            let (branch, time) = tree.sample_cut_point(&self.nodes, &mut self.rng)?;
            if time != self.nodes.time(branch.lower) && time != self.nodes.time(branch.upper) {
                drawn = Some((branch, time));
                break;
            }
        }
        let Some((branch, time)) = drawn else {
            panic!("no admissible cut point on the tree at {pos}");
        };
        // the end tree is only handed over once a cut is accepted
        let tree = match first_tree {
            Some(tree) => tree,
            None => std::mem::take(&mut self.end_tree),
        };
        self.set_cut_tree(pos, tree);
        Some(CutPoint { pos, branch, time })
    }

    /// A point just past a breakpoint drawn uniformly, on the
    /// branch its recombination created.
    pub fn sample_recombination_cut(&mut self) -> Option<CutPoint> {
        let length = self.length_pos();
        let breakpoints = self
            .recombinations
            .range((Excluded(Position::ZERO), Unbounded))
            .map(|(&pos, _)| pos)
            .take_while(|&pos| pos < length)
            .collect::<Vec<_>>();
        if breakpoints.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..breakpoints.len());
        let pos = breakpoints[i];
        let next = breakpoints.get(i + 1).copied().unwrap_or(length);
        let x = Position::new((pos.value() + 1.0).min((pos.value() + next.value()) / 2.0));

        let r = &self.recombinations[&pos];
        let branch = r.recombined_branch();
        if branch.is_null() {
            return None;
        }
        let time = (r.start_time() + self.nodes.time(branch.lower)) / 2.0;
        let tree = self.get_tree_at(x);
        self.set_cut_tree(x, tree);
        Some(CutPoint {
            pos: x,
            branch,
            time,
        })
    }

    /// A point on a mapped branch of a site needing more than one
    /// mutation. Sites are drawn by reservoir sampling, favouring
    /// those with more mapped branches.
    ///
    /// Returns `None` when every site is explained by one mutation.
    pub fn sample_mutation_cut(&mut self) -> Option<CutPoint> {
        let length = self.length_pos();
        let mut count = 0;
        let mut chosen = None;
        for (&x, mapped) in self.mutation_branches.range(..length) {
            let size = mapped.len();
            if size <= 1 {
                continue;
            }
            let replace_prob = size as f64 / (size + count) as f64;
            count += size;
            if self.rng.gen::<f64>() >= replace_prob {
                continue;
            }
            let candidates = mapped
                .iter()
                .filter(|b| !b.is_root_branch())
                .copied()
                .collect::<Vec<_>>();
            if candidates.is_empty() {
                continue;
            }
            chosen = Some((x, candidates[self.rng.gen_range(0..candidates.len())]));
        }
        let (pos, branch) = chosen?;
        let lower = self.nodes.time(branch.lower);
        let upper = self.nodes.time(branch.upper);
        let time = (lower + 1e-3).min((lower + upper) / 2.0);
        debug!(pos = pos.value(), ?branch, "mutation cut");
        let tree = self.get_tree_at(pos);
        self.set_cut_tree(pos, tree);
        Some(CutPoint { pos, branch, time })
    }

    /// The lineage of a sample drawn uniformly, cut just above the
    /// sample at the start of the sequence.
    pub fn sample_terminal_cut(&mut self) -> Option<CutPoint> {
        if self.sample_nodes.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..self.sample_nodes.len());
        let s = self.sample_nodes.iter().nth(i).copied()?;
        let tree = self.get_tree_at(Position::ZERO);
        let branch = Branch::new(s, tree.parent(s)?);
        self.set_cut_tree(Position::ZERO, tree);
        Some(CutPoint {
            pos: Position::ZERO,
            branch,
            time: 1e-10,
        })
    }
}
