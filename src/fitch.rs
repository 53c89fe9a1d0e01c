use crate::node::Nodes;
use crate::recombination::Recombination;
use crate::tree::Tree;
use crate::NodeId;
use crate::Position;

/// Parsimony reconstruction of ancestral states along a
/// sequence of local trees.
///
/// The tree is advanced with [`FitchReconstruction::update`]
/// as the scan crosses breakpoints.
#[derive(Clone, Debug)]
pub struct FitchReconstruction {
    tree: Tree,
}

impl FitchReconstruction {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn update(&mut self, r: &Recombination) {
        self.tree.forward_update(r);
    }

    /// Write the most parsimonious states at `pos` to every
    /// non-sample node of the current tree.
    ///
    /// Ties between candidate states resolve to the lowest one.
    pub fn reconstruct(&self, nodes: &mut Nodes, pos: Position) {
        let preorder = self.preorder();

        // bottom up: candidate sets as bit masks
        let mut masks = crate::NodeMap::<u8>::default();
        for &node in preorder.iter().rev() {
            let mut children = self.tree.children(node).peekable();
            let mask = if children.peek().is_none() {
                1 << nodes.state(node, pos)
            } else {
                let (common, any) = children
                    .map(|c| masks.get(&c).copied().unwrap_or(0))
                    .fold((u8::MAX, 0), |(i, u), m| (i & m, u | m));
                if common != 0 {
                    common
                } else {
                    any
                }
            };
            masks.insert(node, mask);
        }

        // top down
        let mut stack = vec![(NodeId::ROOT, nodes.state(NodeId::ROOT, pos))];
        while let Some((node, state)) = stack.pop() {
            for child in self.tree.children(node) {
                let mask = masks.get(&child).copied().unwrap_or(0);
                let s = if mask & (1 << state) != 0 {
                    state
                } else {
                    mask.trailing_zeros() as u8
                };
                if !nodes[child].is_sample() {
                    nodes.write_state(child, pos, s);
                }
                stack.push((child, nodes.state(child, pos)));
            }
        }
    }

    // Nodes below the root, parents before children.
    fn preorder(&self) -> Vec<NodeId> {
        let mut order = vec![];
        let mut stack = self.tree.children(NodeId::ROOT).collect::<Vec<_>>();
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.tree.children(node));
        }
        order
    }
}

#[cfg(test)]
mod test_fitch {
    use super::*;
    use crate::node::Node;
    use crate::Branch;

    //        4
    //      -----
    //      3   |
    //     ---  |
    //     0 1  2
    fn setup() -> (Nodes, Tree) {
        let mut nodes = Nodes::new();
        for t in [0.0, 0.0, 0.0, 1.0, 2.0] {
            nodes.push(Node::new(t));
        }
        let mut tree = Tree::new();
        for (lower, upper) in [(0, 3), (1, 3), (3, 4), (2, 4)] {
            tree.insert_branch(Branch::new(NodeId::new(lower), NodeId::new(upper)));
        }
        tree.insert_branch(Branch::new(NodeId::new(4), NodeId::ROOT));
        (nodes, tree)
    }

    #[test]
    fn test_single_origin() {
        let (mut nodes, tree) = setup();
        let x = Position::new(10.0);
        nodes.write_state(NodeId::new(0), x, 1);
        nodes.write_state(NodeId::new(1), x, 1);
        FitchReconstruction::new(tree).reconstruct(&mut nodes, x);
        assert_eq!(nodes.state(NodeId::new(3), x), 1);
        assert_eq!(nodes.state(NodeId::new(4), x), 0);
        // samples are untouched
        assert_eq!(nodes.state(NodeId::new(2), x), 0);
    }

    #[test]
    fn test_state_inherited_from_root_side() {
        let (mut nodes, tree) = setup();
        let x = Position::new(10.0);
        nodes.write_state(NodeId::new(0), x, 1);
        nodes.write_state(NodeId::new(2), x, 1);
        FitchReconstruction::new(tree).reconstruct(&mut nodes, x);
        assert_eq!(nodes.state(NodeId::new(4), x), 1);
        assert_eq!(nodes.state(NodeId::new(3), x), 1);
        assert_eq!(nodes.state(NodeId::new(1), x), 0);
    }

    #[test]
    fn test_update_follows_breakpoint() {
        let (mut nodes, tree) = setup();
        nodes.push(Node::new(1.5));
        let n = NodeId::new;
        let r = Recombination::new(
            Position::new(50.0),
            [(0, 3), (1, 3), (3, 4), (2, 4)]
                .into_iter()
                .map(|(l, u)| Branch::new(n(l), n(u)))
                .collect(),
            [(1, 4), (0, 5), (2, 5), (5, 4)]
                .into_iter()
                .map(|(l, u)| Branch::new(n(l), n(u)))
                .collect(),
        );
        let mut fitch = FitchReconstruction::new(tree);
        fitch.update(&r);
        let x = Position::new(70.0);
        nodes.write_state(n(0), x, 1);
        nodes.write_state(n(2), x, 1);
        fitch.reconstruct(&mut nodes, x);
        assert_eq!(nodes.state(n(5), x), 1);
        assert_eq!(nodes.state(n(4), x), 0);
    }
}
