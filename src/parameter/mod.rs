use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

use anyhow::bail;
use log::debug;

use crate::{Checkpoint, Result};

/// Shared handle to a parameter. The subsystem is single-threaded (one MCMC
/// engine thread drives proposal, evaluate, accept/reject strictly in
/// sequence), so `Rc<RefCell<_>>` is the whole concurrency story.
pub type ParamHandle = Rc<RefCell<Parameter>>;

/// Per-dimension bounds, identical for every dimension.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
}

impl Bounds {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// A named vector of doubles with optional bounds, a monotone generation
/// counter and a single checkpoint slot. Rate models never own parameter
/// storage; they hold handles and stamp their caches with `generation()`.
pub struct Parameter {
    pub id: String,
    values: Vec<f64>,
    bounds: Option<Bounds>,
    generation: u64,
    saved: Option<(Vec<f64>, u64)>,
}

impl Parameter {
    pub fn new(id: &str, values: Vec<f64>) -> Self {
        Self {
            id: id.to_string(),
            values,
            bounds: None,
            generation: 0,
            saved: None,
        }
    }

    pub fn with_bounds(id: &str, values: Vec<f64>, lower: f64, upper: f64) -> Result<Self> {
        if lower > upper {
            bail!("Lower bound {} above upper bound {} for {}.", lower, upper, id);
        }
        let bounds = Bounds { lower, upper };
        for &value in &values {
            if !bounds.contains(value) {
                bail!(
                    "Initial value {} of {} outside bounds [{}, {}].",
                    value,
                    id,
                    lower,
                    upper
                );
            }
        }
        let mut param = Self::new(id, values);
        param.bounds = Some(bounds);
        Ok(param)
    }

    pub fn handle(self) -> ParamHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, i: usize) -> f64 {
        self.values[i]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// Monotone mutation counter, bumped by every mutation and by `restore`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_value(&mut self, i: usize, value: f64) {
        if let Some(bounds) = self.bounds {
            assert!(
                bounds.contains(value),
                "Value {} for {}[{}] outside bounds [{}, {}].",
                value,
                self.id,
                i,
                bounds.lower,
                bounds.upper
            );
        }
        debug!("Setting {}[{}] = {}.", self.id, i, value);
        self.values[i] = value;
        self.generation += 1;
    }

    pub fn set_all(&mut self, values: &[f64]) {
        assert_eq!(
            values.len(),
            self.values.len(),
            "Dimension change for {} is not supported.",
            self.id
        );
        if let Some(bounds) = self.bounds {
            for &value in values {
                assert!(
                    bounds.contains(value),
                    "Value {} for {} outside bounds [{}, {}].",
                    value,
                    self.id,
                    bounds.lower,
                    bounds.upper
                );
            }
        }
        self.values.copy_from_slice(values);
        self.generation += 1;
    }
}

impl Checkpoint for Parameter {
    fn store(&mut self) {
        self.saved = Some((self.values.clone(), self.generation));
    }

    fn restore(&mut self) {
        let (values, generation) = self
            .saved
            .take()
            .expect("restore without a preceding store");
        if self.generation != generation {
            self.values = values;
            // Stays monotone; dependents recompute from the restored values.
            self.generation += 1;
        }
    }

    fn accept(&mut self) {
        self.saved = None;
    }
}

impl Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.id, self.values)
    }
}
