use anyhow::bail;

use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

pub mod arbitrary;
pub mod autocorrelated;
pub mod compound;
pub mod continuous;
pub mod differentiable;
pub mod discretized;
pub mod epoch;
pub mod grid;
pub mod local;
pub mod mixture;
pub mod random_local;

pub(crate) mod cache;

pub use arbitrary::{ArbitraryBranchRates, RateTransform};
pub use autocorrelated::{AutocorrelatedBranchRates, ScalingRegime};
pub use compound::{AdditiveBranchRates, CompoundBranchRates, ScaledByTreeTime};
pub use continuous::ContinuousBranchRates;
pub use differentiable::DifferentiableBranchRates;
pub use discretized::DiscretizedBranchRates;
pub use epoch::{EpochBranchRates, EpochRateForm};
pub use grid::GridBranchRates;
pub use local::{CladeClock, ExternalClock, LocalClock, TrunkClock};
pub use mixture::{
    BranchCategoryProvider, CladeCategories, CountableMixture, ParameterCategories, SingleCategory,
};
pub use random_local::RandomLocalClock;

/// Branch-scoped tree trait under which every model reports its rates.
pub const RATE_TRAIT: &str = "rate";
/// Branch-scoped tree trait reporting category assignments where they exist.
pub const CATEGORY_TRAIT: &str = "rateCategory";

/// A tree-indexed function assigning an evolutionary rate to every branch.
///
/// Queries are read-only and may be issued arbitrarily often in any order,
/// provided all mutations of the tree and the underlying parameters go
/// through their generation-bumping setters. The `Checkpoint` supertrait is
/// the accept/reject protocol the MCMC engine drives once per step.
pub trait BranchRateModel: Checkpoint {
    /// Rate for the branch above `node`. The root has no incoming branch;
    /// querying it is a wiring bug and panics.
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64;

    /// Monotone counter folding the generations of everything this model
    /// depends on: it moves whenever any dependency moves, so a wrapping
    /// model can stamp its own cache with it instead of subscribing to the
    /// wrapped model's dependencies one by one.
    fn dependency_generation(&self, tree: &Tree) -> u64;

    /// Names of the branch-scoped traits this model can report.
    fn tree_trait_names(&self) -> Vec<&'static str> {
        vec![RATE_TRAIT]
    }

    /// Numeric trait value for logging; `None` for unknown trait names.
    fn tree_trait(&self, name: &str, tree: &Tree, node: &NodeIdx) -> Option<f64> {
        (name == RATE_TRAIT).then(|| self.branch_rate(tree, node))
    }

    /// Gradient capability, detected at composition time rather than by
    /// runtime type inspection. Defaults to unsupported.
    fn as_differentiable(&self) -> Option<&dyn DifferentiableBranchRates> {
        None
    }
}

pub(crate) fn assert_not_root(tree: &Tree, node: &NodeIdx) {
    assert!(
        !tree.is_root(node),
        "Rate queried for the root, which has no incoming branch."
    );
}

/// Strict molecular clock: one rate shared by every branch.
pub struct StrictClock {
    rate: ParamHandle,
}

impl StrictClock {
    pub fn new(rate: ParamHandle) -> Result<Self> {
        if rate.borrow().dim() != 1 {
            bail!(
                "A strict clock needs a single rate, got dimension {}.",
                rate.borrow().dim()
            );
        }
        Ok(Self { rate })
    }
}

impl BranchRateModel for StrictClock {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        self.rate.borrow().value(0)
    }

    fn dependency_generation(&self, _tree: &Tree) -> u64 {
        self.rate.borrow().generation()
    }
}

impl Checkpoint for StrictClock {
    // Fully stateless on top of its parameter; the engine checkpoints the
    // parameter itself.
    fn store(&mut self) {}
    fn restore(&mut self) {}
    fn accept(&mut self) {}
}

#[cfg(test)]
mod relaxed_tests;
