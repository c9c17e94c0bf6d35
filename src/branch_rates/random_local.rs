use std::cell::RefCell;

use anyhow::bail;
use log::{debug, info};

use crate::branch_rates::arbitrary::node_param_map;
use crate::branch_rates::cache::Memo;
use crate::branch_rates::{assert_not_root, BranchRateModel, RATE_TRAIT};
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

/// Branch-scoped tree trait reporting where the clock switches.
pub const RATE_CHANGED_TRAIT: &str = "rateChanged";

/// Random local clock: binary indicator parameters decide per branch
/// whether the rate switches. Rates propagate from the root towards the
/// tips, either replaced outright or multiplied onto the parent rate, and
/// the whole assignment is rescaled so the time-weighted mean rate equals
/// one (or an explicit mean-rate parameter).
pub struct RandomLocalClock {
    indicators: ParamHandle,
    rates: ParamHandle,
    mean_rate: Option<ParamHandle>,
    rates_are_multipliers: bool,
    node_to_param: Vec<Option<usize>>,
    scaled: RefCell<Memo<Vec<f64>>>,
}

impl RandomLocalClock {
    pub fn new(
        tree: &Tree,
        indicators: ParamHandle,
        rates: ParamHandle,
        mean_rate: Option<ParamHandle>,
        rates_are_multipliers: bool,
    ) -> Result<Self> {
        if indicators.borrow().dim() != tree.branch_count() {
            bail!(
                "Need one indicator per branch: parameter {} has dimension {}, tree has {} branches.",
                indicators.borrow().id,
                indicators.borrow().dim(),
                tree.branch_count()
            );
        }
        if rates.borrow().dim() != tree.branch_count() {
            bail!(
                "Need one rate per branch: parameter {} has dimension {}, tree has {} branches.",
                rates.borrow().id,
                rates.borrow().dim(),
                tree.branch_count()
            );
        }
        if let Some(mean) = &mean_rate {
            if mean.borrow().dim() != 1 {
                bail!("The mean rate must have dimension 1.");
            }
        }
        info!(
            "Random local clock over {} branches, rates are {}.",
            tree.branch_count(),
            if rates_are_multipliers {
                "multipliers"
            } else {
                "replacements"
            }
        );
        Ok(Self {
            indicators,
            rates,
            mean_rate,
            rates_are_multipliers,
            node_to_param: node_param_map(tree),
            scaled: RefCell::new(Memo::new(vec![0.0; tree.len()])),
        })
    }

    fn parameter_index(&self, node: &NodeIdx) -> usize {
        self.node_to_param[usize::from(node)]
            .expect("non-root node missing from the parameter map")
    }

    fn indicator(&self, node: &NodeIdx) -> bool {
        let raw = self.indicators.borrow().value(self.parameter_index(node));
        assert!(
            raw == 0.0 || raw == 1.0,
            "Indicator {} for {} is not binary.",
            raw,
            node
        );
        raw == 1.0
    }

    fn stamp(&self, tree: &Tree) -> Vec<u64> {
        let mut stamp = vec![
            tree.generation(),
            self.indicators.borrow().generation(),
            self.rates.borrow().generation(),
        ];
        if let Some(mean) = &self.mean_rate {
            stamp.push(mean.borrow().generation());
        }
        stamp
    }

    /// Full recomputation: propagate unscaled rates down the tree, then
    /// rescale once so the tree-wide time-weighted mean hits the target.
    fn recompute(&self, tree: &Tree, scaled: &mut Vec<f64>) {
        debug!("Recomputing random local clock rates.");
        scaled.resize(tree.len(), 0.0);
        for idx in &tree.preorder {
            let i = usize::from(idx);
            if tree.is_root(idx) {
                scaled[i] = 1.0;
                continue;
            }
            let parent_rate = scaled[usize::from(&tree.parent(idx).unwrap())];
            scaled[i] = if self.indicator(idx) {
                let value = self.rates.borrow().value(self.parameter_index(idx));
                if self.rates_are_multipliers {
                    parent_rate * value
                } else {
                    value
                }
            } else {
                parent_rate
            };
        }
        let target = self
            .mean_rate
            .as_ref()
            .map_or(1.0, |mean| mean.borrow().value(0));
        let mut tree_rate = 0.0;
        let mut tree_time = 0.0;
        for node in tree.branch_nodes() {
            let blen = tree.blen(&node);
            tree_rate += scaled[usize::from(&node)] * blen;
            tree_time += blen;
        }
        let scale = target * tree_time / tree_rate;
        for rate in scaled.iter_mut() {
            *rate *= scale;
        }
    }
}

impl BranchRateModel for RandomLocalClock {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        let mut scaled = self.scaled.borrow_mut();
        scaled.read(self.stamp(tree), |rates| self.recompute(tree, rates))[usize::from(node)]
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        self.stamp(tree).iter().sum()
    }

    fn tree_trait_names(&self) -> Vec<&'static str> {
        vec![RATE_TRAIT, RATE_CHANGED_TRAIT]
    }

    fn tree_trait(&self, name: &str, tree: &Tree, node: &NodeIdx) -> Option<f64> {
        match name {
            RATE_TRAIT => Some(self.branch_rate(tree, node)),
            RATE_CHANGED_TRAIT => Some(if self.indicator(node) { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl Checkpoint for RandomLocalClock {
    fn store(&mut self) {
        self.scaled.get_mut().store();
    }

    fn restore(&mut self) {
        self.scaled.get_mut().restore();
    }

    fn accept(&mut self) {
        self.scaled.get_mut().accept();
    }
}
