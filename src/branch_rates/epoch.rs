use std::cell::RefCell;

use anyhow::bail;
use log::{debug, info};

use crate::branch_rates::cache::Memo;
use crate::branch_rates::{assert_not_root, BranchRateModel};
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

/// Functional form of the instantaneous rate within an epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EpochRateForm {
    /// Level `k` is the rate of epoch `k`.
    PiecewiseConstant,
    /// Level `k` is the log rate of epoch `k`.
    PiecewiseLogConstant,
    /// Log rate interpolates linearly between the levels at the epoch
    /// endpoints; constant past the last breakpoint.
    PiecewiseLogLinear,
}

/// Time-varying (epoch) clock: sorted breakpoints divide time into
/// adjoining epochs and a branch's rate is the time average of the
/// instantaneous rate over the epochs the branch spans, accumulated hop by
/// hop from the child height up to the parent height with one final
/// division by branch length.
pub struct EpochBranchRates {
    /// Epoch boundaries, strictly ascending, in time before present.
    breakpoints: ParamHandle,
    /// One level per epoch (`breakpoints.dim() + 1` of them).
    levels: ParamHandle,
    form: EpochRateForm,
    rates: RefCell<Memo<Vec<f64>>>,
}

impl EpochBranchRates {
    pub fn new(
        breakpoints: ParamHandle,
        levels: ParamHandle,
        form: EpochRateForm,
    ) -> Result<Self> {
        let epochs = breakpoints.borrow().dim() + 1;
        if levels.borrow().dim() != epochs {
            bail!(
                "Need one level per epoch: {} breakpoint(s) make {} epochs, got {} level(s).",
                breakpoints.borrow().dim(),
                epochs,
                levels.borrow().dim()
            );
        }
        {
            let breakpoints = breakpoints.borrow();
            let times = breakpoints.values();
            if times.iter().any(|&t| t <= 0.0) {
                bail!("Epoch breakpoints must be positive times before present.");
            }
            if times.windows(2).any(|w| w[0] >= w[1]) {
                bail!("Epoch breakpoints must be strictly ascending.");
            }
        }
        info!("Epoch clock with {} epoch(s), {:?}.", epochs, form);
        Ok(Self {
            breakpoints,
            levels,
            form,
            rates: RefCell::new(Memo::new(Vec::new())),
        })
    }

    fn stamp(&self, tree: &Tree) -> Vec<u64> {
        vec![
            tree.generation(),
            self.breakpoints.borrow().generation(),
            self.levels.borrow().generation(),
        ]
    }

    fn recompute(&self, tree: &Tree, rates: &mut Vec<f64>) {
        debug!("Recomputing epoch branch rates.");
        let breakpoints = self.breakpoints.borrow();
        let levels = self.levels.borrow();
        let times = breakpoints.values();
        assert!(
            times.windows(2).all(|w| w[0] < w[1]),
            "Epoch breakpoints no longer ascending."
        );
        *rates = vec![0.0; tree.len()];
        for node in tree.branch_nodes() {
            let child_height = tree.height(&node);
            let parent_height = tree.height(&tree.parent(&node).unwrap());
            rates[usize::from(&node)] = if parent_height > child_height {
                let mut numerator = 0.0;
                for (k, a, b) in hops(times, child_height, parent_height) {
                    numerator += self.form.integral(levels.values(), times, k, a, b);
                }
                numerator / (parent_height - child_height)
            } else {
                // Zero-length branch: the time average degenerates to the
                // instantaneous rate at the shared height.
                self.form
                    .point_rate(levels.values(), times, epoch_of(times, child_height), child_height)
            };
        }
    }

    /// Gradient of the branch's time-averaged rate with respect to the
    /// epoch levels, accumulated with the same hops as the rate itself.
    pub fn gradient_wrt_levels(&self, tree: &Tree, node: &NodeIdx) -> Vec<f64> {
        assert_not_root(tree, node);
        let breakpoints = self.breakpoints.borrow();
        let levels = self.levels.borrow();
        let times = breakpoints.values();
        let child_height = tree.height(node);
        let parent_height = tree.height(&tree.parent(node).unwrap());
        let mut gradient = vec![0.0; levels.dim()];
        if parent_height <= child_height {
            return gradient;
        }
        let weight = 1.0 / (parent_height - child_height);
        for (k, a, b) in hops(times, child_height, parent_height) {
            self.form
                .accumulate_gradient(levels.values(), times, k, a, b, weight, &mut gradient);
        }
        gradient
    }
}

/// Index of the epoch containing time `t`.
fn epoch_of(times: &[f64], t: f64) -> usize {
    times.iter().position(|&b| b > t).unwrap_or(times.len())
}

/// The portions of `[h0, h1]` falling in each epoch, in ascending time
/// order: `(epoch, from, to)` triplets.
fn hops(times: &[f64], h0: f64, h1: f64) -> Vec<(usize, f64, f64)> {
    let mut result = Vec::new();
    let mut k = epoch_of(times, h0);
    let mut cur = h0;
    while cur < h1 {
        let end = if k < times.len() { times[k] } else { f64::INFINITY };
        let b = h1.min(end);
        result.push((k, cur, b));
        cur = b;
        k += 1;
    }
    result
}

impl EpochRateForm {
    fn epoch_bounds(times: &[f64], k: usize) -> (f64, f64) {
        let start = if k == 0 { 0.0 } else { times[k - 1] };
        let end = if k < times.len() { times[k] } else { f64::INFINITY };
        (start, end)
    }

    fn point_rate(&self, levels: &[f64], times: &[f64], k: usize, t: f64) -> f64 {
        match self {
            EpochRateForm::PiecewiseConstant => levels[k],
            EpochRateForm::PiecewiseLogConstant => levels[k].exp(),
            EpochRateForm::PiecewiseLogLinear => {
                if k >= times.len() {
                    return levels[k].exp();
                }
                let (start, end) = Self::epoch_bounds(times, k);
                let u = (t - start) / (end - start);
                (levels[k] + (levels[k + 1] - levels[k]) * u).exp()
            }
        }
    }

    /// Integral of the instantaneous rate over `[a, b]` within epoch `k`.
    fn integral(&self, levels: &[f64], times: &[f64], k: usize, a: f64, b: f64) -> f64 {
        match self {
            EpochRateForm::PiecewiseConstant => levels[k] * (b - a),
            EpochRateForm::PiecewiseLogConstant => levels[k].exp() * (b - a),
            EpochRateForm::PiecewiseLogLinear => {
                if k >= times.len() {
                    return levels[k].exp() * (b - a);
                }
                let (start, end) = Self::epoch_bounds(times, k);
                let slope = (levels[k + 1] - levels[k]) / (end - start);
                if slope.abs() < 1e-12 {
                    return levels[k].exp() * (b - a);
                }
                let at = levels[k] + slope * (a - start);
                let bt = levels[k] + slope * (b - start);
                (bt.exp() - at.exp()) / slope
            }
        }
    }

    /// Adds `weight * d integral / d level` for the hop `[a, b]` of epoch
    /// `k` into `gradient`.
    fn accumulate_gradient(
        &self,
        levels: &[f64],
        times: &[f64],
        k: usize,
        a: f64,
        b: f64,
        weight: f64,
        gradient: &mut [f64],
    ) {
        match self {
            EpochRateForm::PiecewiseConstant => gradient[k] += weight * (b - a),
            EpochRateForm::PiecewiseLogConstant => {
                gradient[k] += weight * levels[k].exp() * (b - a)
            }
            EpochRateForm::PiecewiseLogLinear => {
                if k >= times.len() {
                    gradient[k] += weight * levels[k].exp() * (b - a);
                    return;
                }
                let (start, end) = Self::epoch_bounds(times, k);
                let span = end - start;
                let slope = (levels[k + 1] - levels[k]) / span;
                // d integral / d level splits between the two epoch knots
                // with linear weights 1 - u and u.
                let (int_total, int_u) = if slope.abs() < 1e-12 {
                    let total = levels[k].exp() * (b - a);
                    let mean_u = (0.5 * (a + b) - start) / span;
                    (total, total * mean_u)
                } else {
                    let at = levels[k] + slope * (a - start);
                    let bt = levels[k] + slope * (b - start);
                    let total = (bt.exp() - at.exp()) / slope;
                    // int exp(l(t)) u(t) dt with u linear in t.
                    let ua = (a - start) / span;
                    let ub = (b - start) / span;
                    let d = slope * span; // d l / d u
                    let int_u = (bt.exp() * (ub - 1.0 / d) - at.exp() * (ua - 1.0 / d)) / slope;
                    (total, int_u)
                };
                gradient[k] += weight * (int_total - int_u);
                gradient[k + 1] += weight * int_u;
            }
        }
    }
}

impl BranchRateModel for EpochBranchRates {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        let mut rates = self.rates.borrow_mut();
        rates.read(self.stamp(tree), |rates| self.recompute(tree, rates))[usize::from(node)]
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        self.stamp(tree).iter().sum()
    }
}

impl Checkpoint for EpochBranchRates {
    fn store(&mut self) {
        self.rates.get_mut().store();
    }

    fn restore(&mut self) {
        self.rates.get_mut().restore();
    }

    fn accept(&mut self) {
        self.rates.get_mut().accept();
    }
}
