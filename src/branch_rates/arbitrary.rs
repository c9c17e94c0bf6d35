use anyhow::bail;
use log::info;

use crate::branch_rates::differentiable::DifferentiableBranchRates;
use crate::branch_rates::{assert_not_root, BranchRateModel};
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

/// Map from a free real value to a positive branch rate, with the first and
/// second differentials gradient kernels need.
pub enum RateTransform {
    /// Rate is the parameter itself; the parameter must stay positive.
    Identity,
    Reciprocal,
    /// Parameter is the log rate.
    Exp,
    /// `rate = exp(location + scale * value)`, so a standard-normal value
    /// produces log-normally distributed rates with the given location and
    /// scale.
    LocationScale {
        location: ParamHandle,
        scale: ParamHandle,
    },
}

impl RateTransform {
    fn rate(&self, value: f64) -> f64 {
        match self {
            RateTransform::Identity => value,
            RateTransform::Reciprocal => 1.0 / value,
            RateTransform::Exp => value.exp(),
            RateTransform::LocationScale { location, scale } => {
                (location.borrow().value(0) + scale.borrow().value(0) * value).exp()
            }
        }
    }

    fn differential(&self, value: f64) -> f64 {
        match self {
            RateTransform::Identity => 1.0,
            RateTransform::Reciprocal => -1.0 / (value * value),
            RateTransform::Exp => value.exp(),
            RateTransform::LocationScale { scale, .. } => {
                scale.borrow().value(0) * self.rate(value)
            }
        }
    }

    fn second_differential(&self, value: f64) -> f64 {
        match self {
            RateTransform::Identity => 0.0,
            RateTransform::Reciprocal => 2.0 / (value * value * value),
            RateTransform::Exp => value.exp(),
            RateTransform::LocationScale { scale, .. } => {
                let s = scale.borrow().value(0);
                s * s * self.rate(value)
            }
        }
    }
}

/// One free real value per branch mapped through a [`RateTransform`]. The
/// canonical differentiable base model: anything built on top gets its
/// gradients through this model's differentials.
pub struct ArbitraryBranchRates {
    values: ParamHandle,
    transform: RateTransform,
    /// Node index to parameter slot, built once; `None` only for the root.
    node_to_param: Vec<Option<usize>>,
}

impl ArbitraryBranchRates {
    pub fn new(tree: &Tree, values: ParamHandle, transform: RateTransform) -> Result<Self> {
        if values.borrow().dim() != tree.branch_count() {
            bail!(
                "Need one value per branch: parameter {} has dimension {}, tree has {} branches.",
                values.borrow().id,
                values.borrow().dim(),
                tree.branch_count()
            );
        }
        info!(
            "Arbitrary branch rates over {} branches from parameter {}.",
            tree.branch_count(),
            values.borrow().id
        );
        Ok(Self {
            values,
            transform,
            node_to_param: node_param_map(tree),
        })
    }

    pub(crate) fn free_value(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        self.values.borrow().value(self.parameter_index(tree, node))
    }
}

/// Parameter slots in node-index order, skipping the root. Node indices are
/// stable for the tree's lifetime and topology moves never touch the root
/// index, so the map is built exactly once.
pub(crate) fn node_param_map(tree: &Tree) -> Vec<Option<usize>> {
    let mut map = vec![None; tree.len()];
    let mut slot = 0;
    for node in &tree.nodes {
        if !tree.is_root(&node.idx) {
            map[usize::from(&node.idx)] = Some(slot);
            slot += 1;
        }
    }
    map
}

impl BranchRateModel for ArbitraryBranchRates {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        self.transform.rate(self.free_value(tree, node))
    }

    fn as_differentiable(&self) -> Option<&dyn DifferentiableBranchRates> {
        Some(self)
    }

    fn dependency_generation(&self, _tree: &Tree) -> u64 {
        let mut generation = self.values.borrow().generation();
        if let RateTransform::LocationScale { location, scale } = &self.transform {
            generation += location.borrow().generation() + scale.borrow().generation();
        }
        generation
    }
}

impl DifferentiableBranchRates for ArbitraryBranchRates {
    fn rate_parameter(&self) -> ParamHandle {
        self.values.clone()
    }

    fn parameter_index(&self, tree: &Tree, node: &NodeIdx) -> usize {
        assert_not_root(tree, node);
        self.node_to_param[usize::from(node)]
            .expect("non-root node missing from the parameter map")
    }

    fn branch_rate_differential(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        self.transform.differential(self.free_value(tree, node))
    }

    fn branch_rate_second_differential(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        self.transform.second_differential(self.free_value(tree, node))
    }
}

impl Checkpoint for ArbitraryBranchRates {
    // Rates are recomputed from the parameter on every query; nothing
    // cached, nothing to roll back.
    fn store(&mut self) {}
    fn restore(&mut self) {}
    fn accept(&mut self) {}
}
