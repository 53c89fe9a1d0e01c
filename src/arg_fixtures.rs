//! Shared test graphs.

use crate::arg::Arg;
use crate::recombination::Recombination;
use crate::tree::Tree;
use crate::Branch;
use crate::BranchSet;
use crate::NodeId;
use crate::Position;

fn b(lower: usize, upper: usize) -> Branch {
    Branch::new(NodeId::new(lower), NodeId::new(upper))
}

fn root(lower: usize) -> Branch {
    Branch::new(NodeId::new(lower), NodeId::ROOT)
}

fn set(branches: &[Branch]) -> BranchSet {
    branches.iter().copied().collect()
}

fn tree(branches: &[Branch]) -> Tree {
    let mut tree = Tree::new();
    for &branch in branches {
        tree.insert_branch(branch);
    }
    tree
}

// [0, 50)          [50, 75)          [75, 100)
//
//        4              4                  6
//      -----          -----              -----
//      3   |          |   5              5   |
//     ---  |          |  ---            ---  |
//     0 1  2          1  0 2            0 2  1
//
// Node times: 0, 1 and 2 are samples, 3 at 1.0, 4 at 2.0,
// 5 at 1.5 and 6 at 3.0.
//
// Mutations: 20 on (3, 4) and 70 on (2, 5).
pub(crate) fn two_tree_trees() -> [Tree; 3] {
    [
        tree(&[b(0, 3), b(1, 3), b(3, 4), b(2, 4), root(4)]),
        tree(&[b(1, 4), b(5, 4), b(0, 5), b(2, 5), root(4)]),
        tree(&[b(5, 6), b(1, 6), b(0, 5), b(2, 5), root(6)]),
    ]
}

/// Trees of [`two_tree_arg`] at a point inside each span.
pub(crate) fn two_tree_expected() -> Vec<(Position, Tree)> {
    let [t0, t1, t2] = two_tree_trees();
    vec![
        (Position::new(20.0), t0),
        (Position::new(60.0), t1),
        (Position::new(80.0), t2),
    ]
}

pub(crate) fn two_tree_arg() -> Arg {
    let mut arg = Arg::with_seed(1.0, 100.0, 42);
    for t in [0.0, 0.0, 0.0, 1.0, 2.0, 1.5, 3.0] {
        arg.new_node(t);
    }

    arg.recombinations.insert(
        Position::ZERO,
        Recombination::new(
            Position::ZERO,
            BranchSet::new(),
            set(&[b(0, 3), b(1, 3), b(3, 4), b(2, 4), root(4)]),
        ),
    );
    let x = Position::new(50.0);
    let mut r = Recombination::new(
        x,
        set(&[b(0, 3), b(1, 3), b(3, 4), b(2, 4)]),
        set(&[b(1, 4), b(0, 5), b(2, 5), b(5, 4)]),
    );
    r.set_source(b(0, 3), 0.5);
    arg.recombinations.insert(x, r);
    let x = Position::new(75.0);
    let mut r = Recombination::new(
        x,
        set(&[b(1, 4), b(5, 4), root(4)]),
        set(&[b(5, 6), b(1, 6), root(6)]),
    );
    r.set_source(b(1, 4), 1.2);
    arg.recombinations.insert(x, r);

    let x = Position::new(20.0);
    for n in [0, 1, 3] {
        arg.nodes.write_state(NodeId::new(n), x, 1);
    }
    arg.mutation_sites.insert(x);
    arg.mutation_branches.insert(x, set(&[b(3, 4)]));
    let x = Position::new(70.0);
    arg.nodes.write_state(NodeId::new(2), x, 1);
    arg.mutation_sites.insert(x);
    arg.mutation_branches.insert(x, set(&[b(2, 5)]));

    arg.start_tree = arg.get_tree_at(Position::ZERO);
    arg
}

/// [`two_tree_arg`] as text records, one string per stream.
pub(crate) const TWO_TREE_NODES: &str = "0\n0\n0\n1\n2\n1.5\n3\n";
pub(crate) const TWO_TREE_BRANCHES: &str = "\
3 0 0 50
3 1 0 50
4 3 0 50
4 2 0 50
-1 4 0 75
4 1 50 75
5 0 50 100
5 2 50 100
4 5 50 75
6 5 75 100
6 1 75 100
-1 6 75 100
";
pub(crate) const TWO_TREE_RECOMBINATIONS: &str = "50 0 3 0.5\n75 1 4 1.2\n";
pub(crate) const TWO_TREE_MUTATIONS: &str = "20 3 4 1\n70 2 5 1\n";
