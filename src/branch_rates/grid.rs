use std::cell::RefCell;

use anyhow::bail;
use itertools::Itertools;
use log::{debug, info};
use ordered_float::OrderedFloat;

use crate::branch_rates::cache::Memo;
use crate::branch_rates::{assert_not_root, BranchRateModel};
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

/// Grid-based branch rate model: a fixed ascending grid of time points with
/// one rate level per grid cell. Node indices are sorted by height once per
/// topology/height change; a single sweep with a monotonically advancing
/// grid pointer then yields the cumulative rate integral at every node
/// height in O(nodes + grid points), and a branch's rate is the integral
/// difference across its endpoints divided by its length.
pub struct GridBranchRates {
    grid: ParamHandle,
    levels: ParamHandle,
    /// Node indices ascending by height; depends only on the tree.
    order: RefCell<Memo<Vec<usize>>>,
    /// Cumulative integral of the rate function at each node's height.
    cumulative: RefCell<Memo<Vec<f64>>>,
}

impl GridBranchRates {
    pub fn new(grid: ParamHandle, levels: ParamHandle) -> Result<Self> {
        {
            let grid = grid.borrow();
            let times = grid.values();
            if times.iter().any(|&t| t <= 0.0) {
                bail!("Grid points must be positive times before present.");
            }
            if times.windows(2).any(|w| w[0] >= w[1]) {
                bail!("Grid points must be strictly ascending.");
            }
        }
        if levels.borrow().dim() != grid.borrow().dim() + 1 {
            bail!(
                "Need one level per grid cell: {} grid point(s) make {} cells, got {} level(s).",
                grid.borrow().dim(),
                grid.borrow().dim() + 1,
                levels.borrow().dim()
            );
        }
        info!(
            "Grid branch rates over {} cell(s).",
            grid.borrow().dim() + 1
        );
        Ok(Self {
            grid,
            levels,
            order: RefCell::new(Memo::new(Vec::new())),
            cumulative: RefCell::new(Memo::new(Vec::new())),
        })
    }

    fn sorted_order(&self, tree: &Tree) -> Vec<usize> {
        let mut order = self.order.borrow_mut();
        order
            .read(vec![tree.generation()], |order| {
                debug!("Re-sorting nodes by height.");
                *order = (0..tree.len())
                    .sorted_by_key(|&i| OrderedFloat(tree.nodes[i].height))
                    .collect();
            })
            .clone()
    }

    /// Cumulative rate integral at the height of `idx`.
    fn cumulative_at(&self, tree: &Tree, idx: &NodeIdx) -> f64 {
        let stamp = vec![
            tree.generation(),
            self.grid.borrow().generation(),
            self.levels.borrow().generation(),
        ];
        let mut cumulative = self.cumulative.borrow_mut();
        cumulative.read(stamp, |cumulative| {
            let order = self.sorted_order(tree);
            let grid = self.grid.borrow();
            let levels = self.levels.borrow();
            let times = grid.values();
            *cumulative = vec![0.0; tree.len()];
            // One pass, grid pointer only ever advances.
            let mut k = 0;
            let mut filled = 0.0;
            let mut filled_to = 0.0;
            for i in order {
                let t = tree.nodes[i].height;
                while k < times.len() && times[k] <= t {
                    filled += levels.value(k) * (times[k] - filled_to);
                    filled_to = times[k];
                    k += 1;
                }
                cumulative[i] = filled + levels.value(k) * (t - filled_to);
            }
        })[usize::from(idx)]
    }
}

impl BranchRateModel for GridBranchRates {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        let parent = tree.parent(node).unwrap();
        let blen = tree.blen(node);
        if blen > 0.0 {
            (self.cumulative_at(tree, &parent) - self.cumulative_at(tree, node)) / blen
        } else {
            let t = tree.height(node);
            let grid = self.grid.borrow();
            let cell = grid.values().iter().position(|&b| b > t).unwrap_or(grid.dim());
            self.levels.borrow().value(cell)
        }
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        tree.generation()
            + self.grid.borrow().generation()
            + self.levels.borrow().generation()
    }
}

impl Checkpoint for GridBranchRates {
    fn store(&mut self) {
        self.order.get_mut().store();
        self.cumulative.get_mut().store();
    }

    fn restore(&mut self) {
        self.order.get_mut().restore();
        self.cumulative.get_mut().restore();
    }

    fn accept(&mut self) {
        self.order.get_mut().accept();
        self.cumulative.get_mut().accept();
    }
}
