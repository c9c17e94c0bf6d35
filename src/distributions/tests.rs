use approx::assert_relative_eq;

use crate::param;
use crate::distributions::{ExponentialRates, GammaRates, LogNormalRates, RateDistribution};

#[test]
fn lognormal_median_is_exp_location() {
    let dist = LogNormalRates::new(param!("mean", [0.0]), param!("stdev", [1.0]), false);
    assert_relative_eq!(dist.quantile(0.5), 1.0, epsilon = 1e-8);
    // ln N(0, 1) density at the median.
    assert_relative_eq!(
        dist.ln_pdf(1.0),
        -0.5 * (2.0 * std::f64::consts::PI).ln(),
        epsilon = 1e-10
    );
}

#[test]
fn lognormal_mean_in_real_space_shifts_location() {
    let mean = 2.0;
    let stdev = 0.5;
    let dist = LogNormalRates::new(param!("mean", [mean]), param!("stdev", [stdev]), true);
    let expected_median = f64::exp(f64::ln(mean) - 0.5 * stdev * stdev);
    assert_relative_eq!(dist.quantile(0.5), expected_median, epsilon = 1e-8);
}

#[test]
fn exponential_quantile_closed_form() {
    let mean = 3.0;
    let dist = ExponentialRates::new(param!("mean", [mean]));
    assert_relative_eq!(dist.quantile(0.5), mean * f64::ln(2.0), epsilon = 1e-8);
    assert_relative_eq!(dist.quantile(0.0), 0.0, epsilon = 1e-12);
    // ln pdf is ln(1/mean) - x/mean.
    assert_relative_eq!(
        dist.ln_pdf(1.5),
        -f64::ln(mean) - 1.5 / mean,
        epsilon = 1e-10
    );
}

#[test]
fn gamma_shape_one_is_exponential() {
    let scale = 2.0;
    let gamma = GammaRates::new(param!("shape", [1.0]), param!("scale", [scale]));
    let exp = ExponentialRates::new(param!("mean", [scale]));
    // The gamma quantile is bisected numerically, so compare loosely.
    for p in [0.1, 0.5, 0.9] {
        assert_relative_eq!(gamma.quantile(p), exp.quantile(p), max_relative = 1e-3);
    }
}

#[test]
fn generation_tracks_parameters() {
    let mean = param!("mean", [1.0]);
    let stdev = param!("stdev", [0.5]);
    let dist = LogNormalRates::new(mean.clone(), stdev.clone(), false);
    let gen = dist.generation();
    mean.borrow_mut().set_value(0, 1.5);
    assert!(dist.generation() > gen);
    let gen = dist.generation();
    stdev.borrow_mut().set_value(0, 0.7);
    assert!(dist.generation() > gen);
}

#[test]
#[should_panic]
fn negative_real_space_mean_panics() {
    let dist = LogNormalRates::new(param!("mean", [-1.0]), param!("stdev", [1.0]), true);
    dist.quantile(0.5);
}
