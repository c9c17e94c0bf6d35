use statrs::distribution::{Continuous, ContinuousCDF, Exp, Gamma, LogNormal, Normal};

use crate::parameter::ParamHandle;

/// A continuous rate distribution whose parameters live in MCMC-sampled
/// [`crate::parameter::Parameter`]s. The distribution itself is stateless:
/// every call reads the current parameter values, and `generation()` lets
/// caches detect that those values moved.
pub trait RateDistribution {
    fn quantile(&self, p: f64) -> f64;
    fn ln_pdf(&self, x: f64) -> f64;
    /// Sum of the underlying parameter generations; monotone.
    fn generation(&self) -> u64;
}

/// Log-normal rate distribution. With `mean_in_real_space` the mean
/// parameter is the expectation of the rate itself rather than of its log.
pub struct LogNormalRates {
    mean: ParamHandle,
    stdev: ParamHandle,
    mean_in_real_space: bool,
}

impl LogNormalRates {
    pub fn new(mean: ParamHandle, stdev: ParamHandle, mean_in_real_space: bool) -> Self {
        Self {
            mean,
            stdev,
            mean_in_real_space,
        }
    }

    fn location_scale(&self) -> (f64, f64) {
        let stdev = self.stdev.borrow().value(0);
        let mean = self.mean.borrow().value(0);
        let location = if self.mean_in_real_space {
            assert!(
                mean > 0.0,
                "Real-space mean of a log-normal must be positive, got {}.",
                mean
            );
            mean.ln() - 0.5 * stdev * stdev
        } else {
            mean
        };
        (location, stdev)
    }

    fn current(&self) -> LogNormal {
        let (location, stdev) = self.location_scale();
        LogNormal::new(location, stdev)
            .unwrap_or_else(|_| panic!("Invalid log-normal parameters ({}, {}).", location, stdev))
    }
}

impl RateDistribution for LogNormalRates {
    // Analytic quantile through the accurate normal inverse CDF. The
    // default bisection on the log-normal itself is only good to ~1e-5.
    fn quantile(&self, p: f64) -> f64 {
        let (location, stdev) = self.location_scale();
        (location + stdev * Normal::standard().inverse_cdf(p)).exp()
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        self.current().ln_pdf(x)
    }

    fn generation(&self) -> u64 {
        self.mean.borrow().generation() + self.stdev.borrow().generation()
    }
}

/// Gamma rate distribution parameterized by shape and scale.
pub struct GammaRates {
    shape: ParamHandle,
    scale: ParamHandle,
}

impl GammaRates {
    pub fn new(shape: ParamHandle, scale: ParamHandle) -> Self {
        Self { shape, scale }
    }

    fn current(&self) -> Gamma {
        let shape = self.shape.borrow().value(0);
        let scale = self.scale.borrow().value(0);
        Gamma::new(shape, 1.0 / scale)
            .unwrap_or_else(|_| panic!("Invalid gamma parameters ({}, {}).", shape, scale))
    }
}

impl RateDistribution for GammaRates {
    fn quantile(&self, p: f64) -> f64 {
        self.current().inverse_cdf(p)
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        self.current().ln_pdf(x)
    }

    fn generation(&self) -> u64 {
        self.shape.borrow().generation() + self.scale.borrow().generation()
    }
}

/// Exponential rate distribution parameterized by its mean.
pub struct ExponentialRates {
    mean: ParamHandle,
}

impl ExponentialRates {
    pub fn new(mean: ParamHandle) -> Self {
        Self { mean }
    }

    fn current(&self) -> Exp {
        let mean = self.mean.borrow().value(0);
        Exp::new(1.0 / mean)
            .unwrap_or_else(|_| panic!("Invalid exponential mean {}.", mean))
    }
}

impl RateDistribution for ExponentialRates {
    fn quantile(&self, p: f64) -> f64 {
        -self.mean.borrow().value(0) * (-p).ln_1p()
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        self.current().ln_pdf(x)
    }

    fn generation(&self) -> u64 {
        self.mean.borrow().generation()
    }
}

#[cfg(test)]
mod tests;
