use approx::assert_relative_eq;

use crate::branch_rates::{
    BranchCategoryProvider, BranchRateModel, CladeCategories, ContinuousBranchRates,
    CountableMixture, DiscretizedBranchRates, ParameterCategories, SingleCategory, StrictClock,
    CATEGORY_TRAIT,
};
use crate::distributions::{ExponentialRates, RateDistribution};
use crate::{param, tree, Checkpoint};

fn exponential(mean: f64) -> Box<ExponentialRates> {
    Box::new(ExponentialRates::new(param!("mean", [mean])))
}

#[test]
fn discretized_rates_follow_quantiles() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let categories = param!("cats", [0.0; 6]);
    let model =
        DiscretizedBranchRates::new(&tree, categories.clone(), exponential(1.0), 1, None, false)
            .unwrap();
    assert_eq!(model.category_count(), 6);
    // With no oversampling the default assignment is one category per
    // branch in slot order.
    let dist = ExponentialRates::new(param!("mean", [1.0]));
    for node in tree.branch_nodes() {
        let category = model.tree_trait(CATEGORY_TRAIT, &tree, &node).unwrap();
        let expected = dist.quantile((category + 0.5) / 6.0);
        assert_relative_eq!(model.branch_rate(&tree, &node), expected, epsilon = 1e-12);
    }
    let assigned: Vec<f64> = categories.borrow().values().to_vec();
    let mut sorted = assigned.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(sorted, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn discretized_oversampling_scales_table() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let categories = param!("cats", [0.0; 6]);
    let model =
        DiscretizedBranchRates::new(&tree, categories, exponential(1.0), 3, None, false).unwrap();
    assert_eq!(model.category_count(), 18);
}

#[test]
fn discretized_category_move_changes_one_branch() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let categories = param!("cats", [0.0; 6]);
    let model =
        DiscretizedBranchRates::new(&tree, categories.clone(), exponential(1.0), 1, None, false)
            .unwrap();
    let a = tree.try_idx("A").unwrap();
    let b = tree.try_idx("B").unwrap();
    let before_b = model.branch_rate(&tree, &b);
    let slot_a = 1; // A is the third node in index order, after root and E.
    categories.borrow_mut().set_value(slot_a, 5.0);
    let dist = ExponentialRates::new(param!("mean", [1.0]));
    assert_relative_eq!(
        model.branch_rate(&tree, &a),
        dist.quantile(5.5 / 6.0),
        epsilon = 1e-12
    );
    assert_eq!(model.branch_rate(&tree, &b), before_b);
}

#[test]
fn discretized_table_rebuilt_on_distribution_change() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let mean = param!("mean", [1.0]);
    let dist = Box::new(ExponentialRates::new(mean.clone()));
    let model =
        DiscretizedBranchRates::new(&tree, param!("cats", [0.0; 6]), dist, 1, None, false).unwrap();
    let a = tree.try_idx("A").unwrap();
    let before = model.branch_rate(&tree, &a);
    mean.borrow_mut().set_value(0, 2.0);
    // Exponential quantiles scale linearly in the mean.
    assert_relative_eq!(model.branch_rate(&tree, &a), 2.0 * before, epsilon = 1e-12);
}

#[test]
fn discretized_normalization_hits_weighted_mean() {
    let tree = tree!("((A:1.0,B:2.0)C:1.0,D:0.5)R;");
    let categories = param!("cats", [0.0; 4]);
    let model =
        DiscretizedBranchRates::new(&tree, categories, exponential(2.5), 1, Some(1.0), false)
            .unwrap();
    let mut weighted = 0.0;
    let mut time = 0.0;
    for node in tree.branch_nodes() {
        weighted += model.branch_rate(&tree, &node) * tree.blen(&node);
        time += tree.blen(&node);
    }
    assert_relative_eq!(weighted / time, 1.0, epsilon = 1e-12);
}

#[test]
fn discretized_store_restore_is_exact() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let mean = param!("mean", [1.0]);
    let categories = param!("cats", [0.0; 6]);
    let mut model = DiscretizedBranchRates::new(
        &tree,
        categories.clone(),
        Box::new(ExponentialRates::new(mean.clone())),
        1,
        Some(1.0),
        false,
    )
    .unwrap();
    let before: Vec<f64> = tree.branch_nodes().map(|n| model.branch_rate(&tree, &n)).collect();

    model.store();
    mean.borrow_mut().store();
    categories.borrow_mut().store();
    mean.borrow_mut().set_value(0, 3.0);
    categories.borrow_mut().set_value(0, 4.0);
    let during: Vec<f64> = tree.branch_nodes().map(|n| model.branch_rate(&tree, &n)).collect();
    assert_ne!(before, during);

    model.restore();
    mean.borrow_mut().restore();
    categories.borrow_mut().restore();
    let after: Vec<f64> = tree.branch_nodes().map(|n| model.branch_rate(&tree, &n)).collect();
    // Bit-exact, not merely close.
    assert_eq!(before, after);
}

#[test]
fn discretized_randomized_categories_stay_in_range() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let categories = param!("cats", [0.0; 6]);
    let model =
        DiscretizedBranchRates::new(&tree, categories.clone(), exponential(1.0), 2, None, true)
            .unwrap();
    for &category in categories.borrow().values() {
        assert!(category >= 0.0);
        assert!((category as usize) < model.category_count());
    }
}

#[test]
fn discretized_rejects_bad_arguments() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    assert!(
        DiscretizedBranchRates::new(&tree, param!("cats", [0.0; 5]), exponential(1.0), 1, None, false)
            .is_err()
    );
    assert!(
        DiscretizedBranchRates::new(&tree, param!("cats", [0.0; 6]), exponential(1.0), 0, None, false)
            .is_err()
    );
}

#[test]
fn continuous_rates_follow_quantiles_per_branch() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let quantiles = param!("quantiles", [0.5, 0.1, 0.2, 0.3, 0.6, 0.9], 0.0, 1.0);
    let model =
        ContinuousBranchRates::new(&tree, quantiles.clone(), exponential(1.0), None).unwrap();
    let dist = ExponentialRates::new(param!("mean", [1.0]));
    // Slot order is node-index order: E, A, B, F, C, D.
    let expected = [("E", 0.5), ("A", 0.1), ("B", 0.2), ("F", 0.3), ("C", 0.6), ("D", 0.9)];
    for (id, q) in expected {
        let node = tree.try_idx(id).unwrap();
        assert_relative_eq!(
            model.branch_rate(&tree, &node),
            dist.quantile(q),
            epsilon = 1e-12
        );
    }
    let a = tree.try_idx("A").unwrap();
    let b = tree.try_idx("B").unwrap();
    let before_b = model.branch_rate(&tree, &b);
    quantiles.borrow_mut().set_value(1, 0.75);
    assert_relative_eq!(model.branch_rate(&tree, &a), dist.quantile(0.75), epsilon = 1e-12);
    assert_eq!(model.branch_rate(&tree, &b), before_b);
}

#[test]
fn continuous_rejects_quantiles_outside_unit_interval() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let quantiles = param!("quantiles", [0.5, 1.1, 0.2, 0.3, 0.6, 0.9]);
    assert!(ContinuousBranchRates::new(&tree, quantiles, exponential(1.0), None).is_err());
}

#[test]
fn continuous_normalization_degenerates_to_infinity() {
    // The normalization path never accumulates the tree rate, a defect
    // kept for output compatibility.
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let quantiles = param!("quantiles", [0.5; 6], 0.0, 1.0);
    let model =
        ContinuousBranchRates::new(&tree, quantiles, exponential(1.0), Some(1.0)).unwrap();
    let a = tree.try_idx("A").unwrap();
    assert!(model.branch_rate(&tree, &a).is_infinite());
}

#[test]
fn mixture_single_category_is_constant() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let model = CountableMixture::new(
        param!("effects", [2.0]),
        Box::new(SingleCategory),
        false,
        None,
        Vec::new(),
    )
    .unwrap();
    for node in tree.branch_nodes() {
        assert_relative_eq!(model.branch_rate(&tree, &node), 2.0);
        assert_eq!(model.tree_trait(CATEGORY_TRAIT, &tree, &node), Some(0.0));
    }
}

#[test]
fn mixture_parameter_categories_pick_fixed_effects() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    // Slot order E, A, B, F, C, D.
    let allocation = param!("allocation", [0.0, 1.0, 0.0, 1.0, 2.0, 2.0]);
    let provider = ParameterCategories::new(&tree, allocation, 3).unwrap();
    let model = CountableMixture::new(
        param!("effects", [1.0, 2.0, 3.0]),
        Box::new(provider),
        false,
        None,
        Vec::new(),
    )
    .unwrap();
    let expected = [("E", 1.0), ("A", 2.0), ("B", 1.0), ("F", 2.0), ("C", 3.0), ("D", 3.0)];
    for (id, rate) in expected {
        let node = tree.try_idx(id).unwrap();
        assert_relative_eq!(model.branch_rate(&tree, &node), rate);
    }
}

#[test]
fn mixture_log_space_exponentiates() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let model = CountableMixture::new(
        param!("effects", [f64::ln(2.0)]),
        Box::new(SingleCategory),
        true,
        None,
        Vec::new(),
    )
    .unwrap();
    let a = tree.try_idx("A").unwrap();
    assert_relative_eq!(model.branch_rate(&tree, &a), 2.0, epsilon = 1e-12);
}

#[test]
fn mixture_time_covariate_uses_log_midpoint() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let model = CountableMixture::new(
        param!("effects", [0.0]),
        Box::new(SingleCategory),
        false,
        Some(param!("coefficients", [1.5])),
        Vec::new(),
    )
    .unwrap();
    let a = tree.try_idx("A").unwrap();
    // Branch above A spans heights [0, 1], midpoint 0.5.
    assert_relative_eq!(model.branch_rate(&tree, &a), 1.5 * f64::ln(0.5), epsilon = 1e-12);
}

#[test]
fn mixture_random_effects_add() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let effect: Box<dyn BranchRateModel> =
        Box::new(StrictClock::new(param!("effect", [0.25])).unwrap());
    let model = CountableMixture::new(
        param!("effects", [2.0]),
        Box::new(SingleCategory),
        false,
        None,
        vec![effect],
    )
    .unwrap();
    let a = tree.try_idx("A").unwrap();
    assert_relative_eq!(model.branch_rate(&tree, &a), 2.25);
}

#[test]
fn clade_categories_label_subtree_branches() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let provider =
        CladeCategories::new(&tree, vec![(vec!["A".into(), "B".into()], 1)], 2).unwrap();
    for (id, category) in [("A", 1), ("B", 1), ("E", 1), ("C", 0), ("D", 0), ("F", 0)] {
        let node = tree.try_idx(id).unwrap();
        assert_eq!(provider.category(&tree, &node), category);
    }
}

#[test]
fn clade_categories_follow_topology_moves() {
    let mut tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let provider =
        CladeCategories::new(&tree, vec![(vec!["A".into(), "B".into()], 1)], 2).unwrap();
    let c = tree.try_idx("C").unwrap();
    assert_eq!(provider.category(&tree, &c), 0);
    let a = tree.try_idx("A").unwrap();
    tree.exchange(&a, &c).unwrap();
    // A and B now straddle the root, so their MRCA is the root and every
    // branch inherits the clade's category.
    assert_eq!(provider.category(&tree, &c), 1);
    assert_eq!(provider.category(&tree, &tree.try_idx("D").unwrap()), 1);
}

#[test]
fn mixture_rejects_dimension_mismatches() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    assert!(CountableMixture::new(
        param!("effects", [1.0, 2.0]),
        Box::new(SingleCategory),
        false,
        None,
        Vec::new(),
    )
    .is_err());
    assert!(CountableMixture::new(
        param!("effects", [1.0]),
        Box::new(SingleCategory),
        false,
        Some(param!("coefficients", [1.0, 2.0])),
        Vec::new(),
    )
    .is_err());
    assert!(ParameterCategories::new(&tree, param!("allocation", [0.0; 5]), 2).is_err());
    assert!(CladeCategories::new(&tree, vec![(vec!["Z".into()], 1)], 2).is_err());
    assert!(CladeCategories::new(&tree, vec![(vec!["A".into()], 5)], 2).is_err());
}
