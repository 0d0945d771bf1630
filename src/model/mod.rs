//! The proof-of-work model: a fixed-architecture transformer whose weights
//! are derived deterministically from the block hash.
//!
//! The architecture is the usual pre-norm decoder stack (RMSNorm, rotary
//! multi-head attention with grouped KV heads, SwiGLU feed-forward), but no
//! training ever happens: weights come straight from a seeded PRNG so that
//! every node working on a block evaluates the same function. The draw order
//! in [`Model::build`] is protocol, not implementation detail.

pub mod ops;
pub mod weights;

use crate::params::{Params, ParamsError};

/// Deterministic weight derivation failed; the worker cannot start.
#[derive(thiserror::Error, Debug)]
pub enum WeightInitError {
    #[error("invalid model geometry: {0}")]
    Geometry(#[from] ParamsError),
    #[error("weight allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },
}

struct Layer {
    attn_gain: Vec<f32>,
    wq: Vec<f32>,
    wk: Vec<f32>,
    wv: Vec<f32>,
    wo: Vec<f32>,
    ffn_gain: Vec<f32>,
    w1: Vec<f32>,
    w2: Vec<f32>,
    w3: Vec<f32>,
}

/// A fully materialized model bound to one block hash.
pub struct Model {
    params: Params,
    tok_embedding: Vec<f32>,
    layers: Vec<Layer>,
    norm_gain: Vec<f32>,
    output: Vec<f32>,
    rope_cos: Vec<f32>,
    rope_sin: Vec<f32>,
}

impl Model {
    /// Builds the model for `block_hash`, drawing every weight from a
    /// ChaCha8 stream seeded by the hash.
    pub fn build(params: &Params, block_hash: &str) -> Result<Self, WeightInitError> {
        params.validate()?;

        let dim = params.dim;
        let head_dim = params.head_dim();
        let kv_dim = params.n_kv_heads * head_dim;
        let hidden = params.ffn_hidden_dim();
        let mut rng = weights::seeded_rng("weights", block_hash);

        let tok_embedding = weights::normal(&mut rng, params.vocab_size * dim)?;
        let mut layers = Vec::new();
        layers
            .try_reserve_exact(params.n_layers)
            .map_err(|_| WeightInitError::Allocation {
                bytes: params.n_layers * std::mem::size_of::<Layer>(),
            })?;
        for _ in 0..params.n_layers {
            layers.push(Layer {
                attn_gain: weights::gain(&mut rng, dim)?,
                wq: weights::normal(&mut rng, dim * dim)?,
                wk: weights::normal(&mut rng, kv_dim * dim)?,
                wv: weights::normal(&mut rng, kv_dim * dim)?,
                wo: weights::normal(&mut rng, dim * dim)?,
                ffn_gain: weights::gain(&mut rng, dim)?,
                w1: weights::normal(&mut rng, hidden * dim)?,
                w2: weights::normal(&mut rng, dim * hidden)?,
                w3: weights::normal(&mut rng, hidden * dim)?,
            });
        }
        let norm_gain = weights::gain(&mut rng, dim)?;
        let output = weights::normal(&mut rng, params.vocab_size * dim)?;

        let (rope_cos, rope_sin) = rope_tables(params);

        Ok(Self {
            params: params.clone(),
            tok_embedding,
            layers,
            norm_gain,
            output,
            rope_cos,
            rope_sin,
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Runs the forward pass over one token sequence and returns the logits
    /// of the last position.
    ///
    /// `tokens` must contain exactly `seq_len` ids below `vocab_size`.
    pub fn forward(&self, tokens: &[usize]) -> Vec<f32> {
        let p = &self.params;
        debug_assert_eq!(tokens.len(), p.seq_len);
        let dim = p.dim;
        let head_dim = p.head_dim();
        let half = head_dim / 2;
        let kv_dim = p.n_kv_heads * head_dim;
        let group = p.n_heads / p.n_kv_heads;
        let seq = tokens.len();
        let scale = 1.0 / (head_dim as f64).sqrt();

        // Residual stream, one row per position.
        let mut x = vec![0.0f32; seq * dim];
        for (pos, &tok) in tokens.iter().enumerate() {
            x[pos * dim..(pos + 1) * dim]
                .copy_from_slice(&self.tok_embedding[tok * dim..(tok + 1) * dim]);
        }

        let mut normed = vec![0.0f32; dim];
        let mut q = vec![0.0f32; seq * dim];
        let mut k = vec![0.0f32; seq * kv_dim];
        let mut v = vec![0.0f32; seq * kv_dim];
        let mut attn = vec![0.0f32; seq * dim];
        let mut proj = vec![0.0f32; dim];
        let mut gate = vec![0.0f32; p.ffn_hidden_dim()];
        let mut up = vec![0.0f32; p.ffn_hidden_dim()];

        for layer in &self.layers {
            // Attention block.
            for pos in 0..seq {
                let row = &x[pos * dim..(pos + 1) * dim];
                ops::rmsnorm(row, &layer.attn_gain, p.norm_eps, &mut normed);
                ops::linear(&layer.wq, &normed, &mut q[pos * dim..(pos + 1) * dim]);
                ops::linear(&layer.wk, &normed, &mut k[pos * kv_dim..(pos + 1) * kv_dim]);
                ops::linear(&layer.wv, &normed, &mut v[pos * kv_dim..(pos + 1) * kv_dim]);
                let cos = &self.rope_cos[pos * half..(pos + 1) * half];
                let sin = &self.rope_sin[pos * half..(pos + 1) * half];
                for head in 0..p.n_heads {
                    let start = pos * dim + head * head_dim;
                    ops::apply_rope(&mut q[start..start + head_dim], cos, sin);
                }
                for head in 0..p.n_kv_heads {
                    let start = pos * kv_dim + head * head_dim;
                    ops::apply_rope(&mut k[start..start + head_dim], cos, sin);
                }
            }
            for pos in 0..seq {
                for head in 0..p.n_heads {
                    let kv_head = head / group;
                    let q_row = &q[pos * dim + head * head_dim..pos * dim + (head + 1) * head_dim];
                    let mut scores = vec![0.0f32; pos + 1];
                    for (past, score) in scores.iter_mut().enumerate() {
                        let k_row = &k[past * kv_dim + kv_head * head_dim
                            ..past * kv_dim + (kv_head + 1) * head_dim];
                        let mut acc = 0.0f64;
                        for (&qi, &ki) in q_row.iter().zip(k_row) {
                            acc += f64::from(qi) * f64::from(ki);
                        }
                        *score = (acc * scale) as f32;
                    }
                    ops::softmax(&mut scores);
                    let out =
                        &mut attn[pos * dim + head * head_dim..pos * dim + (head + 1) * head_dim];
                    out.fill(0.0);
                    for (past, &weight) in scores.iter().enumerate() {
                        let v_row = &v[past * kv_dim + kv_head * head_dim
                            ..past * kv_dim + (kv_head + 1) * head_dim];
                        for (o, &vi) in out.iter_mut().zip(v_row) {
                            *o += weight * vi;
                        }
                    }
                }
            }
            for pos in 0..seq {
                ops::linear(&layer.wo, &attn[pos * dim..(pos + 1) * dim], &mut proj);
                for (xi, &pi) in x[pos * dim..(pos + 1) * dim].iter_mut().zip(&proj) {
                    *xi += pi;
                }
            }

            // Feed-forward block.
            for pos in 0..seq {
                let row = &x[pos * dim..(pos + 1) * dim];
                ops::rmsnorm(row, &layer.ffn_gain, p.norm_eps, &mut normed);
                ops::linear(&layer.w1, &normed, &mut gate);
                ops::linear(&layer.w3, &normed, &mut up);
                for (g, &u) in gate.iter_mut().zip(up.iter()) {
                    *g = ops::silu(*g) * u;
                }
                ops::linear(&layer.w2, &gate, &mut proj);
                for (xi, &pi) in x[pos * dim..(pos + 1) * dim].iter_mut().zip(&proj) {
                    *xi += pi;
                }
            }
        }

        let last = &x[(seq - 1) * dim..seq * dim];
        ops::rmsnorm(last, &self.norm_gain, p.norm_eps, &mut normed);
        let mut logits = vec![0.0f32; p.vocab_size];
        ops::linear(&self.output, &normed, &mut logits);
        logits
    }
}

/// Precomputes rotary cos/sin tables for every position, `seq_len * head_dim/2`
/// entries each.
fn rope_tables(params: &Params) -> (Vec<f32>, Vec<f32>) {
    let half = params.head_dim() / 2;
    let mut freqs = Vec::with_capacity(half);
    for i in 0..half {
        let exponent = -2.0 * i as f64 / params.head_dim() as f64;
        let mut freq = params.rope_theta.powf(exponent);
        if params.use_scaled_rope {
            freq = scale_frequency(freq);
        }
        freqs.push(freq);
    }
    let mut cos = Vec::with_capacity(params.seq_len * half);
    let mut sin = Vec::with_capacity(params.seq_len * half);
    for pos in 0..params.seq_len {
        for &freq in &freqs {
            let angle = pos as f64 * freq;
            cos.push(angle.cos() as f32);
            sin.push(angle.sin() as f32);
        }
    }
    (cos, sin)
}

/// Long-context frequency scaling: low-frequency components are slowed by
/// `SCALE_FACTOR`, with a smooth ramp between the two wavelength cutoffs.
fn scale_frequency(freq: f64) -> f64 {
    const SCALE_FACTOR: f64 = 8.0;
    const LOW_FREQ_FACTOR: f64 = 1.0;
    const HIGH_FREQ_FACTOR: f64 = 4.0;
    const ORIGINAL_CONTEXT_LEN: f64 = 8192.0;

    let wavelen = 2.0 * std::f64::consts::PI / freq;
    let low_wavelen = ORIGINAL_CONTEXT_LEN / LOW_FREQ_FACTOR;
    let high_wavelen = ORIGINAL_CONTEXT_LEN / HIGH_FREQ_FACTOR;
    if wavelen < high_wavelen {
        freq
    } else if wavelen > low_wavelen {
        freq / SCALE_FACTOR
    } else {
        let smooth = (ORIGINAL_CONTEXT_LEN / wavelen - LOW_FREQ_FACTOR)
            / (HIGH_FREQ_FACTOR - LOW_FREQ_FACTOR);
        (1.0 - smooth) * freq / SCALE_FACTOR + smooth * freq
    }
}
