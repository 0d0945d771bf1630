//! Deterministic weight derivation from the block hash.
//!
//! Every node that shares a block hash must build bit-identical weights, so
//! the draw order below is part of the network protocol and must never be
//! reordered. The PRNG is ChaCha8 seeded with `sha256(context ‖ block_hash)`;
//! distinct context labels give independent streams for weights and the
//! session target vector.

use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use statrs::distribution::Normal;

use super::WeightInitError;

/// Standard deviation of all projection-weight draws.
pub const WEIGHT_STD: f64 = 0.02;

/// ChaCha8 stream bound to `(context, block_hash)`.
pub fn seeded_rng(context: &str, block_hash: &str) -> ChaCha8Rng {
    let mut hasher = Sha256::new();
    hasher.update(context.as_bytes());
    hasher.update(block_hash.as_bytes());
    let digest = hasher.finalize();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    ChaCha8Rng::from_seed(seed)
}

/// Allocates a weight buffer, reporting OOM as [`WeightInitError`] instead
/// of aborting the worker.
pub fn alloc(len: usize) -> Result<Vec<f32>, WeightInitError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| WeightInitError::Allocation {
            bytes: len * std::mem::size_of::<f32>(),
        })?;
    Ok(buf)
}

/// Draws `len` values from N(0, [`WEIGHT_STD`]²).
pub fn normal(rng: &mut ChaCha8Rng, len: usize) -> Result<Vec<f32>, WeightInitError> {
    let dist = Normal::new(0.0, WEIGHT_STD).expect("valid normal parameters");
    let mut buf = alloc(len)?;
    for _ in 0..len {
        buf.push(dist.sample(rng) as f32);
    }
    Ok(buf)
}

/// Draws `len` norm-gain values from N(1, [`WEIGHT_STD`]²).
///
/// Gains are centered on the RMSNorm identity so the residual stream keeps
/// its scale, but they come from the same seeded stream as every other
/// tensor: two nodes agree on a block's model only if they agree on all of
/// it.
pub fn gain(rng: &mut ChaCha8Rng, len: usize) -> Result<Vec<f32>, WeightInitError> {
    let dist = Normal::new(1.0, WEIGHT_STD).expect("valid normal parameters");
    let mut buf = alloc(len)?;
    for _ in 0..len {
        buf.push(dist.sample(rng) as f32);
    }
    Ok(buf)
}

/// Draws a standard-normal vector and scales it to unit L2 norm.
pub fn unit_vector(rng: &mut ChaCha8Rng, len: usize) -> Result<Vec<f32>, WeightInitError> {
    let dist = Normal::new(0.0, 1.0).expect("valid normal parameters");
    let mut buf = alloc(len)?;
    for _ in 0..len {
        buf.push(dist.sample(rng) as f32);
    }
    let norm = super::ops::l2_norm(&buf).max(f64::MIN_POSITIVE);
    for v in &mut buf {
        *v = (f64::from(*v) / norm) as f32;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_hash_same_stream() {
        let mut a = seeded_rng("weights", "0xabc");
        let mut b = seeded_rng("weights", "0xabc");
        assert_eq!(normal(&mut a, 64).unwrap(), normal(&mut b, 64).unwrap());
    }

    #[test]
    fn different_hash_different_stream() {
        let mut a = seeded_rng("weights", "0xabc");
        let mut b = seeded_rng("weights", "0xdef");
        assert_ne!(normal(&mut a, 64).unwrap(), normal(&mut b, 64).unwrap());
    }

    #[test]
    fn contexts_are_independent() {
        let mut a = seeded_rng("weights", "0xabc");
        let mut b = seeded_rng("target", "0xabc");
        assert_ne!(normal(&mut a, 64).unwrap(), normal(&mut b, 64).unwrap());
    }

    #[test]
    fn gain_draws_center_on_unity() {
        let mut rng = seeded_rng("weights", "0xabc");
        let gains = gain(&mut rng, 1024).unwrap();
        let mean = gains.iter().map(|&g| f64::from(g)).sum::<f64>() / gains.len() as f64;
        assert!((mean - 1.0).abs() < 0.01);
        assert!(gains.iter().any(|&g| g != 1.0));
    }

    #[test]
    fn unit_vector_has_unit_norm() {
        let mut rng = seeded_rng("target", "0xabc");
        let v = unit_vector(&mut rng, 128).unwrap();
        assert!((super::super::ops::l2_norm(&v) - 1.0).abs() < 1e-6);
    }
}
