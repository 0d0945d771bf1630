//! Sequential f32 kernels for the proof-of-work forward pass.
//!
//! Everything here is deliberately scalar and single-threaded: the network
//! requires bit-identical distances from every node that shares a block
//! hash, so reduction order must be fixed. Accumulations run in f64 to keep
//! the deeper configurations away from f32 drift.

/// `y = W x` for a row-major weight matrix `W[out_dim][in_dim]`.
pub fn linear(w: &[f32], x: &[f32], out: &mut [f32]) {
    let in_dim = x.len();
    debug_assert_eq!(w.len(), out.len() * in_dim);
    for (row, y) in out.iter_mut().enumerate() {
        let base = row * in_dim;
        let mut acc = 0.0f64;
        for (i, &xi) in x.iter().enumerate() {
            acc += f64::from(w[base + i]) * f64::from(xi);
        }
        *y = acc as f32;
    }
}

/// RMS normalization with learned gain: `x_i * g_i / rms(x)`.
pub fn rmsnorm(x: &[f32], gain: &[f32], eps: f64, out: &mut [f32]) {
    debug_assert_eq!(x.len(), gain.len());
    let mut sum = 0.0f64;
    for &v in x {
        sum += f64::from(v) * f64::from(v);
    }
    let inv_rms = 1.0 / (sum / x.len() as f64 + eps).sqrt();
    for ((o, &v), &g) in out.iter_mut().zip(x).zip(gain) {
        *o = (f64::from(v) * inv_rms * f64::from(g)) as f32;
    }
}

/// In-place softmax over one score row.
pub fn softmax(scores: &mut [f32]) {
    let mut max = f32::NEG_INFINITY;
    for &s in scores.iter() {
        if s > max {
            max = s;
        }
    }
    let mut sum = 0.0f64;
    for s in scores.iter_mut() {
        let e = f64::from(*s - max).exp();
        *s = e as f32;
        sum += e;
    }
    let inv = 1.0 / sum;
    for s in scores.iter_mut() {
        *s = (f64::from(*s) * inv) as f32;
    }
}

/// SiLU activation `x * sigmoid(x)`.
pub fn silu(x: f32) -> f32 {
    let x = f64::from(x);
    (x / (1.0 + (-x).exp())) as f32
}

/// Rotates consecutive pairs of `x` by the position's precomputed angles.
pub fn apply_rope(x: &mut [f32], cos: &[f32], sin: &[f32]) {
    debug_assert_eq!(x.len(), 2 * cos.len());
    for i in 0..cos.len() {
        let (a, b) = (x[2 * i], x[2 * i + 1]);
        x[2 * i] = a * cos[i] - b * sin[i];
        x[2 * i + 1] = a * sin[i] + b * cos[i];
    }
}

/// Euclidean norm of `x`, accumulated in f64.
pub fn l2_norm(x: &[f32]) -> f64 {
    let mut sum = 0.0f64;
    for &v in x {
        sum += f64::from(v) * f64::from(v);
    }
    sum.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_matches_hand_computation() {
        // W = [[1, 2], [3, 4], [5, 6]], x = [1, -1]
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = [1.0, -1.0];
        let mut out = [0.0f32; 3];
        linear(&w, &x, &mut out);
        assert_eq!(out, [-1.0, -1.0, -1.0]);
    }

    #[test]
    fn softmax_sums_to_one_and_orders() {
        let mut scores = [1.0f32, 2.0, 3.0];
        softmax(&mut scores);
        let sum: f32 = scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(scores[0] < scores[1] && scores[1] < scores[2]);
    }

    #[test]
    fn rmsnorm_produces_unit_rms() {
        let x = [3.0f32, 4.0];
        let gain = [1.0f32, 1.0];
        let mut out = [0.0f32; 2];
        rmsnorm(&x, &gain, 0.0, &mut out);
        let rms = (out.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>() / 2.0).sqrt();
        assert!((rms - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rope_preserves_pair_norms() {
        let mut x = [1.0f32, 2.0, -3.0, 0.5];
        let cos = [0.6f32, 0.8];
        let sin = [0.8f32, 0.6];
        let before: Vec<f32> = x
            .chunks(2)
            .map(|p| (p[0] * p[0] + p[1] * p[1]).sqrt())
            .collect();
        apply_rope(&mut x, &cos, &sin);
        let after: Vec<f32> = x
            .chunks(2)
            .map(|p| (p[0] * p[0] + p[1] * p[1]).sqrt())
            .collect();
        for (b, a) in before.iter().zip(&after) {
            assert!((b - a).abs() < 1e-5);
        }
    }
}
