//! Model hyperparameters shared by every worker in a session.
//!
//! `Params` travel inside the init request and must be identical on every
//! node working on the same block: together with the block hash they fully
//! determine the proof-of-work model weights, so any divergence here splits
//! the network.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Hyperparameters of the proof-of-work transformer.
///
/// The defaults mirror the network's production configuration; tests and
/// benchmarks construct smaller variants explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Embedding width.
    pub dim: usize,
    /// Number of transformer blocks.
    pub n_layers: usize,
    /// Attention heads per block.
    pub n_heads: usize,
    /// Key/value heads per block (grouped-query attention when < `n_heads`).
    pub n_kv_heads: usize,
    /// Vocabulary size; also the length of the session target vector.
    pub vocab_size: usize,
    /// Multiplier applied to the FFN hidden width.
    pub ffn_dim_multiplier: f64,
    /// The FFN hidden width is rounded up to a multiple of this.
    pub multiple_of: usize,
    /// RMSNorm epsilon.
    pub norm_eps: f64,
    /// Rotary embedding base frequency.
    pub rope_theta: f64,
    /// Apply long-context frequency scaling to the rotary embedding.
    pub use_scaled_rope: bool,
    /// Input sequence length fed to the model for each nonce.
    pub seq_len: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            dim: 512,
            n_layers: 64,
            n_heads: 128,
            n_kv_heads: 128,
            vocab_size: 8192,
            ffn_dim_multiplier: 16.0,
            multiple_of: 1024,
            norm_eps: 1e-5,
            rope_theta: 500_000.0,
            use_scaled_rope: true,
            seq_len: 4,
        }
    }
}

/// A `Params` value that cannot describe a realizable model.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParamsError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("dim {dim} is not divisible by n_heads {n_heads}")]
    HeadSplit { dim: usize, n_heads: usize },
    #[error("n_heads {n_heads} is not divisible by n_kv_heads {n_kv_heads}")]
    KvGrouping { n_heads: usize, n_kv_heads: usize },
    #[error("head dimension {0} must be even for rotary embeddings")]
    OddHeadDim(usize),
    #[error("ffn_dim_multiplier {0} must be positive and finite")]
    FfnMultiplier(f64),
}

/// Failure to read the default params file named by `MODEL_PARAMS_PATH`.
#[derive(thiserror::Error, Debug)]
pub enum ParamsFileError {
    #[error("failed to read params file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse params file {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ParamsError),
}

impl Params {
    /// Checks that the hyperparameters describe a constructible model.
    pub fn validate(&self) -> Result<(), ParamsError> {
        for (value, name) in [
            (self.dim, "dim"),
            (self.n_layers, "n_layers"),
            (self.n_heads, "n_heads"),
            (self.n_kv_heads, "n_kv_heads"),
            (self.vocab_size, "vocab_size"),
            (self.multiple_of, "multiple_of"),
            (self.seq_len, "seq_len"),
        ] {
            if value == 0 {
                return Err(ParamsError::Zero(name));
            }
        }
        if self.dim % self.n_heads != 0 {
            return Err(ParamsError::HeadSplit {
                dim: self.dim,
                n_heads: self.n_heads,
            });
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(ParamsError::KvGrouping {
                n_heads: self.n_heads,
                n_kv_heads: self.n_kv_heads,
            });
        }
        if self.head_dim() % 2 != 0 {
            return Err(ParamsError::OddHeadDim(self.head_dim()));
        }
        if !self.ffn_dim_multiplier.is_finite() || self.ffn_dim_multiplier <= 0.0 {
            return Err(ParamsError::FfnMultiplier(self.ffn_dim_multiplier));
        }
        Ok(())
    }

    /// Width of a single attention head.
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Hidden width of the SwiGLU feed-forward block.
    ///
    /// Follows the Llama derivation: two thirds of `4 * dim`, scaled by
    /// `ffn_dim_multiplier`, rounded up to a multiple of `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        let hidden = 4 * self.dim;
        let hidden = 2 * hidden / 3;
        let hidden = (self.ffn_dim_multiplier * hidden as f64) as usize;
        hidden.div_ceil(self.multiple_of) * self.multiple_of
    }

    /// Loads and validates params from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ParamsFileError> {
        let display = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|source| ParamsFileError::Io {
            path: display.clone(),
            source,
        })?;
        let params: Params =
            serde_json::from_str(&raw).map_err(|source| ParamsFileError::Json {
                path: display,
                source,
            })?;
        params.validate()?;
        Ok(params)
    }
}
