use std::cell::RefCell;

use anyhow::bail;
use log::info;

use crate::branch_rates::cache::Memo;
use crate::branch_rates::{assert_not_root, BranchRateModel};
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

/// Product of the wrapped models' rates at every branch.
pub struct CompoundBranchRates {
    models: Vec<Box<dyn BranchRateModel>>,
}

impl CompoundBranchRates {
    pub fn new(models: Vec<Box<dyn BranchRateModel>>) -> Result<Self> {
        if models.len() < 2 {
            bail!("A compound rate model needs at least two sub-models.");
        }
        info!("Compound (product) rate model over {} sub-models.", models.len());
        Ok(Self { models })
    }
}

impl BranchRateModel for CompoundBranchRates {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        self.models
            .iter()
            .map(|model| model.branch_rate(tree, node))
            .product()
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        self.models
            .iter()
            .map(|model| model.dependency_generation(tree))
            .sum()
    }
}

impl Checkpoint for CompoundBranchRates {
    fn store(&mut self) {
        for model in &mut self.models {
            model.store();
        }
    }

    fn restore(&mut self) {
        for model in &mut self.models {
            model.restore();
        }
    }

    fn accept(&mut self) {
        for model in &mut self.models {
            model.accept();
        }
    }
}

/// Sum of the wrapped models' rates at every branch.
pub struct AdditiveBranchRates {
    models: Vec<Box<dyn BranchRateModel>>,
}

impl AdditiveBranchRates {
    pub fn new(models: Vec<Box<dyn BranchRateModel>>) -> Result<Self> {
        if models.len() < 2 {
            bail!("An additive rate model needs at least two sub-models.");
        }
        info!("Additive (sum) rate model over {} sub-models.", models.len());
        Ok(Self { models })
    }
}

impl BranchRateModel for AdditiveBranchRates {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        self.models
            .iter()
            .map(|model| model.branch_rate(tree, node))
            .sum()
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        self.models
            .iter()
            .map(|model| model.dependency_generation(tree))
            .sum()
    }
}

impl Checkpoint for AdditiveBranchRates {
    fn store(&mut self) {
        for model in &mut self.models {
            model.store();
        }
    }

    fn restore(&mut self) {
        for model in &mut self.models {
            model.restore();
        }
    }

    fn accept(&mut self) {
        for model in &mut self.models {
            model.accept();
        }
    }
}

/// Rescales a wrapped model so the expected substitution count over the
/// whole tree (the sum of rate times branch length) equals a target
/// parameter, regardless of how the wrapped rates move.
pub struct ScaledByTreeTime {
    inner: Box<dyn BranchRateModel>,
    total: ParamHandle,
    factor: RefCell<Memo<f64>>,
}

impl ScaledByTreeTime {
    pub fn new(inner: Box<dyn BranchRateModel>, total: ParamHandle) -> Result<Self> {
        if total.borrow().dim() != 1 {
            bail!("The target tree length must have dimension 1.");
        }
        Ok(Self {
            inner,
            total,
            factor: RefCell::new(Memo::new(1.0)),
        })
    }

    fn factor(&self, tree: &Tree) -> f64 {
        let stamp = vec![
            tree.generation(),
            self.inner.dependency_generation(tree),
            self.total.borrow().generation(),
        ];
        let mut factor = self.factor.borrow_mut();
        *factor.read(stamp, |factor| {
            let mut expected = 0.0;
            for node in tree.branch_nodes() {
                expected += self.inner.branch_rate(tree, &node) * tree.blen(&node);
            }
            *factor = self.total.borrow().value(0) / expected;
        })
    }
}

impl BranchRateModel for ScaledByTreeTime {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        self.inner.branch_rate(tree, node) * self.factor(tree)
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        tree.generation()
            + self.inner.dependency_generation(tree)
            + self.total.borrow().generation()
    }
}

impl Checkpoint for ScaledByTreeTime {
    fn store(&mut self) {
        self.inner.store();
        self.factor.get_mut().store();
    }

    fn restore(&mut self) {
        self.inner.restore();
        self.factor.get_mut().restore();
    }

    fn accept(&mut self) {
        self.inner.accept();
        self.factor.get_mut().accept();
    }
}
