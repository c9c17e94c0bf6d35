use std::fmt::{self, Debug, Display};

use anyhow::bail;
use log::debug;

use crate::{Checkpoint, Result};
use NodeIdx::{Internal as Int, Leaf};

pub mod tree_parser;

#[derive(Debug, PartialEq, Clone, Copy, PartialOrd, Eq, Ord, Hash)]
pub enum NodeIdx {
    Internal(usize),
    Leaf(usize),
}

impl From<NodeIdx> for usize {
    fn from(node_idx: NodeIdx) -> usize {
        match node_idx {
            Int(idx) => idx,
            Leaf(idx) => idx,
        }
    }
}

impl From<&NodeIdx> for usize {
    fn from(node_idx: &NodeIdx) -> usize {
        usize::from(*node_idx)
    }
}

impl Display for NodeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Int(idx) => write!(f, "internal node {}", idx),
            Leaf(idx) => write!(f, "leaf node {}", idx),
        }
    }
}

/// A node of the arena tree. Nodes are stored in a flat vector and keep the
/// index they were assigned at build time for the tree's whole lifetime;
/// topology moves rewire parent/child links but never renumber.
#[derive(Clone)]
pub struct Node {
    pub idx: NodeIdx,
    pub parent: Option<NodeIdx>,
    pub children: Vec<NodeIdx>,
    /// Time before the most recent tip, root maximal.
    pub height: f64,
    pub id: String,
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{}", self.idx)
        } else {
            write!(f, "{} with id {}", self.idx, self.id)
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "({}) {:?} at height {}, parent: {:?}, children: {:?}",
            self.id, self.idx, self.height, self.parent, self.children,
        )
    }
}

impl Node {
    pub(crate) fn new_leaf(idx: usize, parent: Option<NodeIdx>, height: f64, id: String) -> Self {
        Self {
            idx: Leaf(idx),
            parent,
            children: Vec::new(),
            height,
            id,
        }
    }

    pub(crate) fn new_empty_internal(node_idx: usize) -> Self {
        Self {
            idx: Int(node_idx),
            parent: None,
            children: Vec::new(),
            height: 0.0,
            id: "".to_string(),
        }
    }
}

#[derive(Clone)]
struct TreeSnapshot {
    nodes: Vec<Node>,
    root: NodeIdx,
    postorder: Vec<NodeIdx>,
    preorder: Vec<NodeIdx>,
}

/// Rooted time tree shared read-only by all rate models. Mutation goes
/// through `set_height`/`exchange`, each of which advances the generation
/// counter that downstream caches stamp themselves with.
pub struct Tree {
    pub root: NodeIdx,
    pub nodes: Vec<Node>,
    pub postorder: Vec<NodeIdx>,
    pub preorder: Vec<NodeIdx>,
    pub n: usize,
    pub complete: bool,
    generation: u64,
    saved: Option<(TreeSnapshot, u64)>,
}

impl Tree {
    pub(crate) fn new_empty() -> Self {
        Self {
            root: Int(0),
            nodes: Vec::new(),
            postorder: Vec::new(),
            preorder: Vec::new(),
            n: 0,
            complete: false,
            generation: 0,
            saved: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of branches, one per non-root node.
    pub fn branch_count(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn node(&self, idx: &NodeIdx) -> &Node {
        &self.nodes[usize::from(idx)]
    }

    pub fn is_root(&self, idx: &NodeIdx) -> bool {
        *idx == self.root
    }

    pub fn is_leaf(&self, idx: &NodeIdx) -> bool {
        matches!(idx, Leaf(_))
    }

    pub fn parent(&self, idx: &NodeIdx) -> Option<NodeIdx> {
        self.node(idx).parent
    }

    pub fn children(&self, idx: &NodeIdx) -> &[NodeIdx] {
        &self.node(idx).children
    }

    pub fn height(&self, idx: &NodeIdx) -> f64 {
        self.node(idx).height
    }

    /// Branch length of the edge above `idx`; zero for the root, which has
    /// no incoming branch.
    pub fn blen(&self, idx: &NodeIdx) -> f64 {
        match self.node(idx).parent {
            Some(parent) => self.height(&parent) - self.height(idx),
            None => 0.0,
        }
    }

    /// Sum of all branch lengths.
    pub fn total_time(&self) -> f64 {
        self.nodes.iter().map(|node| self.blen(&node.idx)).sum()
    }

    pub fn try_idx(&self, id: &str) -> Result<NodeIdx> {
        match self.nodes.iter().find(|node| node.id == id) {
            Some(node) => Ok(node.idx),
            None => bail!("No node with id {} found in the tree.", id),
        }
    }

    pub fn by_id(&self, id: &str) -> &Node {
        self.node(&self.try_idx(id).unwrap())
    }

    pub fn leaf_indices(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.nodes.iter().map(|node| node.idx).filter(|idx| matches!(idx, Leaf(_)))
    }

    /// All non-root nodes, i.e. one entry per branch, in preorder.
    pub fn branch_nodes(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.preorder.iter().copied().filter(|idx| !self.is_root(idx))
    }

    /// Monotone mutation counter; bumped by every height or topology change
    /// and by `restore`. Caches compare stamps against it instead of
    /// subscribing to listener callbacks.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bump(&mut self) {
        self.generation += 1;
    }

    pub(crate) fn complete(&mut self) {
        self.n = (self.nodes.len() + 1) / 2;
        debug_assert_eq!(self.nodes.len(), self.n * 2 - 1);
        self.complete = true;
        self.compute_postorder();
        self.compute_preorder();
    }

    pub(crate) fn compute_postorder(&mut self) {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = Vec::with_capacity(self.nodes.len());
        stack.push(self.root);
        while let Some(cur) = stack.pop() {
            order.push(cur);
            for child in self.children(&cur) {
                stack.push(*child);
            }
        }
        order.reverse();
        self.postorder = order;
    }

    pub(crate) fn compute_preorder(&mut self) {
        self.preorder = self.preorder_subroot(self.root);
    }

    pub fn preorder_subroot(&self, subroot_idx: NodeIdx) -> Vec<NodeIdx> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = Vec::with_capacity(self.nodes.len());
        stack.push(subroot_idx);
        while let Some(cur) = stack.pop() {
            order.push(cur);
            for child in self.children(&cur).iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    /// Moves a node in time. The new height must stay between the node's
    /// tallest child and its parent; anything else is a broken proposal.
    pub fn set_height(&mut self, idx: &NodeIdx, height: f64) {
        assert!(height >= 0.0, "Node heights must be non-negative.");
        if let Some(parent) = self.parent(idx) {
            assert!(
                height <= self.height(&parent),
                "Node height {} above parent height {}.",
                height,
                self.height(&parent)
            );
        }
        for child in self.children(idx).to_vec() {
            assert!(
                self.height(&child) <= height,
                "Node height {} below child height {}.",
                height,
                self.height(&child)
            );
        }
        self.nodes[usize::from(idx)].height = height;
        self.bump();
    }

    /// Swaps the subtrees rooted at `a` and `b` by rewiring their parent
    /// links. Node indices and the root index are untouched, so any
    /// node-to-parameter maps built at model construction stay valid.
    pub fn exchange(&mut self, a: &NodeIdx, b: &NodeIdx) -> Result<()> {
        if self.is_root(a) || self.is_root(b) {
            bail!("Cannot exchange the root.");
        }
        let parent_a = self.parent(a).unwrap();
        let parent_b = self.parent(b).unwrap();
        if parent_a == parent_b {
            bail!("Exchanging siblings is a no-op.");
        }
        if self.is_ancestor(a, b) || self.is_ancestor(b, a) {
            bail!("Cannot exchange a node with its own ancestor.");
        }
        if self.height(a) > self.height(&parent_b) || self.height(b) > self.height(&parent_a) {
            bail!("Exchange would place a node above its new parent.");
        }
        debug!("Exchanging subtrees at {} and {}.", a, b);
        self.replace_child(&parent_a, a, b);
        self.replace_child(&parent_b, b, a);
        self.nodes[usize::from(a)].parent = Some(parent_b);
        self.nodes[usize::from(b)].parent = Some(parent_a);
        self.compute_postorder();
        self.compute_preorder();
        self.bump();
        Ok(())
    }

    fn replace_child(&mut self, parent: &NodeIdx, old: &NodeIdx, new: &NodeIdx) {
        let children = &mut self.nodes[usize::from(parent)].children;
        let pos = children.iter().position(|c| c == old).unwrap();
        children[pos] = *new;
    }

    fn is_ancestor(&self, ancestor: &NodeIdx, node: &NodeIdx) -> bool {
        let mut cur = *node;
        while let Some(parent) = self.parent(&cur) {
            if parent == *ancestor {
                return true;
            }
            cur = parent;
        }
        false
    }

    pub fn to_newick(&self) -> String {
        format!("{};", self.subtree_newick(&self.root))
    }

    fn subtree_newick(&self, idx: &NodeIdx) -> String {
        let node = self.node(idx);
        let label = if node.children.is_empty() {
            node.id.clone()
        } else {
            let subtrees: Vec<String> = node
                .children
                .iter()
                .map(|child| self.subtree_newick(child))
                .collect();
            format!("({}){}", subtrees.join(","), node.id)
        };
        format!("{}:{}", label, self.blen(idx))
    }
}

impl Checkpoint for Tree {
    fn store(&mut self) {
        self.saved = Some((
            TreeSnapshot {
                nodes: self.nodes.clone(),
                root: self.root,
                postorder: self.postorder.clone(),
                preorder: self.preorder.clone(),
            },
            self.generation,
        ));
    }

    fn restore(&mut self) {
        let (snapshot, generation) = self
            .saved
            .take()
            .expect("restore without a preceding store");
        if self.generation != generation {
            self.nodes = snapshot.nodes;
            self.root = snapshot.root;
            self.postorder = snapshot.postorder;
            self.preorder = snapshot.preorder;
            // The counter stays monotone so stale stamps can never be
            // revived by a later proposal reusing a generation number.
            self.bump();
        }
    }

    fn accept(&mut self) {
        self.saved = None;
    }
}

impl Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tree with {} tips, rooted at {:?}:", self.n, self.root)?;
        for node in &self.nodes {
            write!(f, "  {:?}", node)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
mod tests;
