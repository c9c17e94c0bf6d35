use anyhow::Error;

pub mod branch_rates;
pub mod distributions;
pub mod macros;
pub mod parameter;
pub mod tree;

type Result<T> = std::result::Result<T, Error>;

/// Snapshot/rollback protocol driven by the MCMC engine: every proposal is
/// bracketed by `store`, then either `accept` (snapshot discarded) or
/// `restore` (exact rollback to the state held at `store`).
pub trait Checkpoint {
    fn store(&mut self);
    fn restore(&mut self);
    fn accept(&mut self);
}

pub fn assert_float_relative_slice_eq(actual: &[f64], expected: &[f64], epsilon: f64) {
    use approx::relative_eq;
    assert_eq!(
        actual.len(),
        expected.len(),
        "Must have the same number of entries."
    );
    for (i, (&act, &exp)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            relative_eq!(act, exp, epsilon = epsilon),
            "Entries at position {} do not match, actual: {}, expected: {}",
            i,
            act,
            exp,
        );
    }
}
