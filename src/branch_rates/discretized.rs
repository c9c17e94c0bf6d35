use std::cell::RefCell;

use anyhow::bail;
use log::{debug, info};
use rand::Rng;

use crate::branch_rates::arbitrary::node_param_map;
use crate::branch_rates::cache::Memo;
use crate::branch_rates::{assert_not_root, BranchRateModel, CATEGORY_TRAIT, RATE_TRAIT};
use crate::distributions::RateDistribution;
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

cfg_if::cfg_if! {
    if #[cfg(feature = "deterministic")] {
        fn category_rng() -> impl Rng {
            use rand::SeedableRng;
            rand::rngs::StdRng::seed_from_u64(42)
        }
    } else {
        fn category_rng() -> impl Rng {
            rand::thread_rng()
        }
    }
}

/// Discretized relaxed clock: the rate distribution is cut into
/// `(node_count - 1) * over_sampling` equal-probability quantile bins and
/// every branch holds a persisted integer bin assignment.
///
/// The whole quantile table is recomputed together when the distribution's
/// parameters move; a change of the category assignment only changes which
/// table entry a branch looks up and never touches the table itself.
pub struct DiscretizedBranchRates {
    distribution: Box<dyn RateDistribution>,
    categories: ParamHandle,
    category_count: usize,
    /// Branch-length-weighted mean rate the table is rescaled to, if any.
    normalize_to: Option<f64>,
    node_to_param: Vec<Option<usize>>,
    rates: RefCell<Memo<Vec<f64>>>,
    factor: RefCell<Memo<f64>>,
}

impl DiscretizedBranchRates {
    pub fn new(
        tree: &Tree,
        categories: ParamHandle,
        distribution: Box<dyn RateDistribution>,
        over_sampling: usize,
        normalize_to: Option<f64>,
        randomize: bool,
    ) -> Result<Self> {
        if over_sampling == 0 {
            bail!("Oversampling must be at least 1.");
        }
        if categories.borrow().dim() != tree.branch_count() {
            bail!(
                "Need one category per branch: parameter {} has dimension {}, tree has {} branches.",
                categories.borrow().id,
                categories.borrow().dim(),
                tree.branch_count()
            );
        }
        let category_count = tree.branch_count() * over_sampling;
        let initial: Vec<f64> = if randomize {
            let mut rng = category_rng();
            (0..tree.branch_count())
                .map(|_| rng.gen_range(0..category_count) as f64)
                .collect()
        } else {
            (0..tree.branch_count())
                .map(|i| ((i as f64 + 0.5) * over_sampling as f64).floor())
                .collect()
        };
        categories.borrow_mut().set_all(&initial);
        info!(
            "Discretized relaxed clock with {} categories over {} branches{}.",
            category_count,
            tree.branch_count(),
            if normalize_to.is_some() {
                ", normalized"
            } else {
                ""
            }
        );
        Ok(Self {
            distribution,
            categories,
            category_count,
            normalize_to,
            node_to_param: node_param_map(tree),
            rates: RefCell::new(Memo::new(vec![0.0; category_count])),
            factor: RefCell::new(Memo::new(1.0)),
        })
    }

    pub fn category_count(&self) -> usize {
        self.category_count
    }

    fn parameter_index(&self, node: &NodeIdx) -> usize {
        self.node_to_param[usize::from(node)]
            .expect("non-root node missing from the parameter map")
    }

    fn category(&self, node: &NodeIdx) -> usize {
        let raw = self.categories.borrow().value(self.parameter_index(node));
        let category = raw.round();
        assert!(
            category >= 0.0 && (category as usize) < self.category_count,
            "Category {} for {} outside [0, {}).",
            raw,
            node,
            self.category_count
        );
        category as usize
    }

    /// Table entry for a category, before normalization.
    fn raw_rate(&self, category: usize) -> f64 {
        let stamp = vec![self.distribution.generation()];
        let mut rates = self.rates.borrow_mut();
        let table = rates.read(stamp, |table| {
            debug!("Recomputing the quantile table.");
            let count = table.len() as f64;
            for (category, rate) in table.iter_mut().enumerate() {
                *rate = self.distribution.quantile((category as f64 + 0.5) / count);
            }
        });
        table[category]
    }

    /// Scalar making the branch-length-weighted mean of the returned rates
    /// equal the target; invalidated by tree, distribution or assignment
    /// changes.
    fn norm_factor(&self, tree: &Tree) -> f64 {
        let target = match self.normalize_to {
            Some(target) => target,
            None => return 1.0,
        };
        let stamp = vec![
            tree.generation(),
            self.distribution.generation(),
            self.categories.borrow().generation(),
        ];
        let mut factor = self.factor.borrow_mut();
        *factor.read(stamp, |factor| {
            let mut tree_rate = 0.0;
            let mut tree_time = 0.0;
            for node in tree.branch_nodes() {
                let blen = tree.blen(&node);
                tree_rate += self.raw_rate(self.category(&node)) * blen;
                tree_time += blen;
            }
            *factor = target * tree_time / tree_rate;
            debug!("Normalization factor recomputed as {}.", factor);
        })
    }
}

impl BranchRateModel for DiscretizedBranchRates {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        self.raw_rate(self.category(node)) * self.norm_factor(tree)
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        tree.generation()
            + self.distribution.generation()
            + self.categories.borrow().generation()
    }

    fn tree_trait_names(&self) -> Vec<&'static str> {
        vec![RATE_TRAIT, CATEGORY_TRAIT]
    }

    fn tree_trait(&self, name: &str, tree: &Tree, node: &NodeIdx) -> Option<f64> {
        match name {
            RATE_TRAIT => Some(self.branch_rate(tree, node)),
            CATEGORY_TRAIT => Some(self.category(node) as f64),
            _ => None,
        }
    }
}

impl Checkpoint for DiscretizedBranchRates {
    fn store(&mut self) {
        self.rates.get_mut().store();
        self.factor.get_mut().store();
    }

    fn restore(&mut self) {
        self.rates.get_mut().restore();
        self.factor.get_mut().restore();
    }

    fn accept(&mut self) {
        self.rates.get_mut().accept();
        self.factor.get_mut().accept();
    }
}
