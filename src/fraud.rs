//! Statistical honesty test for validated batches.
//!
//! An honest submitter only ships entries it computed itself, so the only
//! source of invalid entries in its batches is numeric drift between devices,
//! bounded by a small per-nonce probability. Under that null hypothesis the
//! invalid count of an `N`-entry batch is Binomial(`N`, [`HONEST_MISMATCH_PROBABILITY`]);
//! a submitter whose invalid count lands deep in the tail is fabricating
//! distances.

use statrs::function::beta::beta_reg;

/// Network-wide bound on an honest submitter's per-nonce invalid probability.
///
/// Matches the operating point used when calibrating `r_target`: the target
/// is placed at the 1e-3 quantile of the distance distribution, and
/// cross-device drift is absorbed within the same margin.
pub const HONEST_MISMATCH_PROBABILITY: f64 = 1e-3;

/// Survival probability `P(X >= n_invalid)` for `X ~ Binomial(batch_size, p*)`.
///
/// Evaluated through the regularized incomplete beta function,
/// `P(X >= k) = I_p(k, n - k + 1)`, which stays accurate far into the tail
/// for batch sizes up to 1e5 where naive summation of binomial terms would
/// underflow.
pub fn probability_honest(batch_size: usize, n_invalid: usize) -> f64 {
    if n_invalid == 0 {
        return 1.0;
    }
    if n_invalid > batch_size {
        return 0.0;
    }
    let n = batch_size as f64;
    let k = n_invalid as f64;
    beta_reg(k, n - k + 1.0, HONEST_MISMATCH_PROBABILITY)
}
