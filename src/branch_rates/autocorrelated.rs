use std::cell::RefCell;

use anyhow::bail;
use log::info;
use statrs::distribution::{Continuous, Normal};

use crate::branch_rates::arbitrary::ArbitraryBranchRates;
use crate::branch_rates::cache::Memo;
use crate::branch_rates::differentiable::DifferentiableBranchRates;
use crate::branch_rates::BranchRateModel;
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

/// How the transition standard deviation scales with branch length.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScalingRegime {
    /// Same variance on every branch.
    Constant,
    /// Variance proportional to branch length, the Brownian convention.
    ProportionalToLength,
}

/// Autocorrelated branch rates: the (log) rate performs a random walk along
/// the tree, each branch drawn around its parent's value with a Normal
/// transition. Wraps an [`ArbitraryBranchRates`] as the rate provider and
/// adds the increment log-density and its analytic gradient.
pub struct AutocorrelatedBranchRates {
    rates: ArbitraryBranchRates,
    stdev: ParamHandle,
    regime: ScalingRegime,
    /// Increments live on the log-rate scale rather than the rate scale.
    log_scale: bool,
    density: RefCell<Memo<f64>>,
}

impl AutocorrelatedBranchRates {
    pub fn new(
        rates: ArbitraryBranchRates,
        stdev: ParamHandle,
        regime: ScalingRegime,
        log_scale: bool,
    ) -> Result<Self> {
        if stdev.borrow().dim() != 1 {
            bail!("The transition standard deviation must have dimension 1.");
        }
        info!("Autocorrelated branch rates, {:?} scaling.", regime);
        Ok(Self {
            rates,
            stdev,
            regime,
            log_scale,
            density: RefCell::new(Memo::new(0.0)),
        })
    }

    /// Value the random walk tracks at `node`; zero at the root.
    fn walk_value(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        if tree.is_root(node) {
            return 0.0;
        }
        let rate = self.rates.branch_rate(tree, node);
        if self.log_scale {
            rate.ln()
        } else {
            rate
        }
    }

    fn transition_sd(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        let sd = self.stdev.borrow().value(0);
        match self.regime {
            ScalingRegime::Constant => sd,
            ScalingRegime::ProportionalToLength => sd * tree.blen(node).sqrt(),
        }
    }

    fn stamp(&self, tree: &Tree) -> Vec<u64> {
        vec![
            tree.generation(),
            self.stdev.borrow().generation(),
            self.rates.rate_parameter().borrow().generation(),
        ]
    }

    /// Log-density of the increments, accumulated down the tree from an
    /// assumed root value of zero.
    pub fn log_density(&self, tree: &Tree) -> f64 {
        let mut density = self.density.borrow_mut();
        *density.read(self.stamp(tree), |density| {
            let mut total = 0.0;
            for node in tree.branch_nodes() {
                let parent = tree.parent(&node).unwrap();
                let increment = self.walk_value(tree, &node) - self.walk_value(tree, &parent);
                let sd = self.transition_sd(tree, &node);
                if sd == 0.0 {
                    // A zero length branch pins the walk to the parent's
                    // value; any other increment has zero probability.
                    if increment != 0.0 {
                        total = f64::NEG_INFINITY;
                        break;
                    }
                    continue;
                }
                let normal = Normal::new(0.0, sd)
                    .unwrap_or_else(|_| panic!("Invalid transition sd {}.", sd));
                total += normal.ln_pdf(increment);
            }
            *density = total;
        })
    }

    /// Analytic gradient of the log-density with respect to the per-branch
    /// walk values, postorder: each branch's own contribution plus its
    /// children's downstream contributions. Indexed by parameter slot.
    pub fn gradient_wrt_increments(&self, tree: &Tree) -> Vec<f64> {
        let mut gradient = vec![0.0; tree.branch_count()];
        for idx in &tree.postorder {
            if tree.is_root(idx) {
                continue;
            }
            let parent = tree.parent(idx).unwrap();
            let value = self.walk_value(tree, idx);
            let sd = self.transition_sd(tree, idx);
            let mut g = -(value - self.walk_value(tree, &parent)) / (sd * sd);
            for child in tree.children(idx) {
                let child_sd = self.transition_sd(tree, child);
                g += (self.walk_value(tree, child) - value) / (child_sd * child_sd);
            }
            gradient[self.rates.parameter_index(tree, idx)] = g;
        }
        gradient
    }

    /// Gradient of the log-density with respect to the underlying free
    /// parameter, chained through the walk-value and rate transforms.
    pub fn gradient_log_density(&self, tree: &Tree) -> Vec<f64> {
        let wrt_walk = self.gradient_wrt_increments(tree);
        let mut gradient = vec![0.0; tree.branch_count()];
        for node in tree.branch_nodes() {
            let i = self.rates.parameter_index(tree, &node);
            let rate_diff = self.rates.branch_rate_differential(tree, &node);
            let walk_diff = if self.log_scale {
                rate_diff / self.rates.branch_rate(tree, &node)
            } else {
                rate_diff
            };
            gradient[i] = wrt_walk[i] * walk_diff;
        }
        gradient
    }
}

impl BranchRateModel for AutocorrelatedBranchRates {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        self.rates.branch_rate(tree, node)
    }

    fn as_differentiable(&self) -> Option<&dyn DifferentiableBranchRates> {
        Some(&self.rates)
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        self.rates.dependency_generation(tree) + self.stdev.borrow().generation()
    }
}

impl Checkpoint for AutocorrelatedBranchRates {
    fn store(&mut self) {
        self.density.get_mut().store();
        self.rates.store();
    }

    fn restore(&mut self) {
        self.density.get_mut().restore();
        self.rates.restore();
    }

    fn accept(&mut self) {
        self.density.get_mut().accept();
        self.rates.accept();
    }
}
