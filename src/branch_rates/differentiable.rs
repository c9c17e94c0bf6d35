use crate::branch_rates::BranchRateModel;
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};

/// Gradient capability needed by gradient-based transition kernels (HMC).
///
/// `parameter_index` maps a tree node to its flat slot in the rate-bearing
/// parameter through a map built once at construction, so node indices and
/// parameter indices can never be mixed up by off-by-one arithmetic.
pub trait DifferentiableBranchRates: BranchRateModel {
    fn rate_parameter(&self) -> ParamHandle;

    /// Flat index of the branch above `node` in `rate_parameter()`.
    fn parameter_index(&self, tree: &Tree, node: &NodeIdx) -> usize;

    /// d rate / d free parameter for the branch above `node`.
    fn branch_rate_differential(&self, tree: &Tree, node: &NodeIdx) -> f64;

    /// d2 rate / d free parameter2 for the branch above `node`.
    fn branch_rate_second_differential(&self, tree: &Tree, node: &NodeIdx) -> f64;

    /// Chain rule mapping a gradient with respect to the branch rates into
    /// a gradient with respect to the underlying free parameter. Both
    /// slices are indexed by `parameter_index`.
    fn update_gradient_log_density(&self, tree: &Tree, grad_wrt_rates: &[f64]) -> Vec<f64> {
        assert_eq!(grad_wrt_rates.len(), tree.branch_count());
        let mut gradient = vec![0.0; tree.branch_count()];
        for node in tree.branch_nodes() {
            let i = self.parameter_index(tree, &node);
            gradient[i] = grad_wrt_rates[i] * self.branch_rate_differential(tree, &node);
        }
        gradient
    }

    /// Chain rule for the diagonal of the Hessian:
    /// `h_p = h_r * (dr/dp)^2 + g_r * d2r/dp2`.
    fn update_diagonal_hessian_log_density(
        &self,
        tree: &Tree,
        hessian_wrt_rates: &[f64],
        grad_wrt_rates: &[f64],
    ) -> Vec<f64> {
        assert_eq!(hessian_wrt_rates.len(), tree.branch_count());
        assert_eq!(grad_wrt_rates.len(), tree.branch_count());
        let mut hessian = vec![0.0; tree.branch_count()];
        for node in tree.branch_nodes() {
            let i = self.parameter_index(tree, &node);
            let first = self.branch_rate_differential(tree, &node);
            let second = self.branch_rate_second_differential(tree, &node);
            hessian[i] = hessian_wrt_rates[i] * first * first + grad_wrt_rates[i] * second;
        }
        hessian
    }
}
