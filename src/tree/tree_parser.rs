use std::fmt;

use anyhow::bail;
use log::info;
use pest::{error::Error as PestError, iterators::Pair, Parser};
use pest_derive::Parser;

use crate::tree::{Node, NodeIdx, Tree};
use crate::Result;

#[derive(Parser)]
#[grammar = "./tree/newick.pest"]
pub struct NewickParser;

#[derive(Debug)]
pub struct ParsingError(pub(crate) Box<PestError<Rule>>);

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Malformed newick string")?;
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParsingError {}

/// Parses one or more rooted binary time trees from a newick string.
/// Node indices are assigned in preorder encounter order and stay stable
/// for the tree's lifetime; heights are derived from the branch lengths
/// with the deepest tip placed at height zero.
pub fn from_newick(newick_string: &str) -> Result<Vec<Tree>> {
    info!("Parsing newick trees.");
    let mut trees = Vec::new();
    let newick_rule = match NewickParser::parse(Rule::newick, newick_string) {
        Ok(mut pairs) => pairs.next().unwrap(),
        Err(e) => bail!(ParsingError(Box::new(e))),
    };
    for tree_rule in newick_rule.into_inner() {
        if tree_rule.as_rule() != Rule::tree {
            continue;
        }
        let node_rule = tree_rule.into_inner().next().unwrap();
        let mut builder = TreeBuilder::default();
        let root = builder.parse_node(node_rule)?;
        trees.push(builder.build(root)?);
    }
    info!("Finished parsing {} newick tree(s).", trees.len());
    Ok(trees)
}

#[derive(Default)]
struct TreeBuilder {
    nodes: Vec<Node>,
    blens: Vec<f64>,
}

impl TreeBuilder {
    fn parse_node(&mut self, rule: Pair<Rule>) -> Result<NodeIdx> {
        match rule.as_rule() {
            Rule::leaf => self.parse_leaf(rule),
            Rule::internal => self.parse_internal(rule),
            _ => unreachable!(),
        }
    }

    fn parse_leaf(&mut self, rule: Pair<Rule>) -> Result<NodeIdx> {
        let node_idx = self.nodes.len();
        let mut id = String::new();
        let mut blen = 0.0;
        for inner in rule.into_inner() {
            match inner.as_rule() {
                Rule::label => id = inner.as_str().to_string(),
                Rule::branch_length => blen = parse_blen(inner)?,
                _ => unreachable!(),
            }
        }
        self.nodes.push(Node::new_leaf(node_idx, None, 0.0, id));
        self.blens.push(blen);
        Ok(NodeIdx::Leaf(node_idx))
    }

    fn parse_internal(&mut self, rule: Pair<Rule>) -> Result<NodeIdx> {
        let node_idx = self.nodes.len();
        self.nodes.push(Node::new_empty_internal(node_idx));
        self.blens.push(0.0);
        let mut children = Vec::new();
        for inner in rule.into_inner() {
            match inner.as_rule() {
                Rule::label => self.nodes[node_idx].id = inner.as_str().to_string(),
                Rule::branch_length => self.blens[node_idx] = parse_blen(inner)?,
                Rule::internal | Rule::leaf => {
                    let child = self.parse_node(inner)?;
                    self.nodes[usize::from(child)].parent = Some(NodeIdx::Internal(node_idx));
                    children.push(child);
                }
                _ => unreachable!(),
            }
        }
        if children.len() != 2 {
            bail!(
                "Clock models need rooted binary trees, found a node with {} children.",
                children.len()
            );
        }
        self.nodes[node_idx].children = children;
        Ok(NodeIdx::Internal(node_idx))
    }

    fn build(self, root: NodeIdx) -> Result<Tree> {
        let mut tree = Tree::new_empty();
        tree.root = root;
        tree.nodes = self.nodes;
        tree.complete();

        // Heights from branch lengths: depth below the root first, then
        // flip so the deepest tip sits at height zero.
        let mut depths = vec![0.0; tree.len()];
        for idx in tree.preorder.clone() {
            if let Some(parent) = tree.parent(&idx) {
                depths[usize::from(&idx)] = depths[usize::from(&parent)] + self.blens[usize::from(&idx)];
            }
        }
        let max_depth = depths.iter().cloned().fold(0.0, f64::max);
        for (i, depth) in depths.iter().enumerate() {
            tree.nodes[i].height = max_depth - depth;
        }
        for idx in tree.postorder.clone() {
            if let Some(parent) = tree.parent(&idx) {
                if tree.height(&idx) > tree.height(&parent) {
                    bail!("Negative branch length above {}.", tree.node(&idx));
                }
            }
        }
        Ok(tree)
    }
}

fn parse_blen(rule: Pair<Rule>) -> Result<f64> {
    let float_rule = rule.into_inner().next().unwrap();
    Ok(float_rule.as_str().parse::<f64>()?)
}
