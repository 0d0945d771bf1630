//! Distance computation over enumerated nonces.
//!
//! `Compute` owns one model instance and converts nonces into proof
//! candidates. The published distance rule: hash the submitter key and the
//! nonce into a token sequence, run the forward pass, L2-normalize the
//! last-position logits and measure the Euclidean distance to the session's
//! unit target vector. Small distances are proofs.

use sha2::{Digest, Sha256};

use crate::batch::ProofBatch;
use crate::model::{Model, WeightInitError, ops, weights};
use crate::session::Session;

/// A forward pass produced a non-finite value; the batch cannot be scored.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("non-finite output for nonce {nonce}")]
    NonFinite { nonce: u64 },
}

/// One device's model instance plus the session identity it computes for.
pub struct Compute {
    model: Model,
    target: Vec<f32>,
    session: Session,
}

impl Compute {
    /// Builds the model and the session target vector. Expensive: this is
    /// the per-worker initialization the controller reports as `LOADING`.
    pub fn new(session: Session) -> Result<Self, WeightInitError> {
        let model = Model::build(&session.params, &session.block_hash)?;
        let mut rng = weights::seeded_rng("target", &session.block_hash);
        let target = weights::unit_vector(&mut rng, session.params.vocab_size)?;
        Ok(Self {
            model,
            target,
            session,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Token sequence for `(public_key, nonce)`: a SHA-256 stream expanded
    /// to `seq_len` ids modulo the vocabulary.
    fn tokens(&self, public_key: &str, nonce: u64) -> Vec<usize> {
        let params = self.model.params();
        let mut seed = Sha256::new();
        seed.update(public_key.as_bytes());
        seed.update(nonce.to_be_bytes());
        let seed = seed.finalize();

        let mut tokens = Vec::with_capacity(params.seq_len);
        let mut counter: u32 = 0;
        'outer: loop {
            let mut block = Sha256::new();
            block.update(seed);
            block.update(counter.to_be_bytes());
            let digest = block.finalize();
            for chunk in digest.chunks_exact(4) {
                let id = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                tokens.push(id as usize % params.vocab_size);
                if tokens.len() == params.seq_len {
                    break 'outer;
                }
            }
            counter += 1;
        }
        tokens
    }

    /// Distance of one nonce for `public_key`. Pure in
    /// `(weights, public_key, nonce)`.
    fn distance(&self, public_key: &str, nonce: u64) -> Result<f32, ComputeError> {
        let tokens = self.tokens(public_key, nonce);
        let logits = self.model.forward(&tokens);
        let norm = ops::l2_norm(&logits);
        if !norm.is_finite() {
            return Err(ComputeError::NonFinite { nonce });
        }
        let norm = norm.max(f64::MIN_POSITIVE);
        let mut sum = 0.0f64;
        for (&o, &t) in logits.iter().zip(&self.target) {
            let d = f64::from(o) / norm - f64::from(t);
            sum += d * d;
        }
        let dist = sum.sqrt() as f32;
        if !dist.is_finite() {
            return Err(ComputeError::NonFinite { nonce });
        }
        Ok(dist)
    }

    /// Computes distances for a batch of freshly enumerated nonces, tagged
    /// with the session identity. No filtering happens here.
    pub fn generate(&self, nonces: &[u64]) -> Result<ProofBatch, ComputeError> {
        let mut dist = Vec::with_capacity(nonces.len());
        for &nonce in nonces {
            dist.push(self.distance(&self.session.public_key, nonce)?);
        }
        Ok(ProofBatch {
            public_key: self.session.public_key.clone(),
            block_hash: self.session.block_hash.clone(),
            block_height: self.session.block_height,
            nonces: nonces.to_vec(),
            dist,
        })
    }

    /// Recomputes distances for a peer batch, keyed by the submitter's
    /// public key. Returns a batch with the same tag and nonces but locally
    /// computed distances.
    pub fn validate(&self, batch: &ProofBatch) -> Result<ProofBatch, ComputeError> {
        let mut dist = Vec::with_capacity(batch.nonces.len());
        for &nonce in &batch.nonces {
            dist.push(self.distance(&batch.public_key, nonce)?);
        }
        Ok(ProofBatch {
            public_key: batch.public_key.clone(),
            block_hash: batch.block_hash.clone(),
            block_height: batch.block_height,
            nonces: batch.nonces.clone(),
            dist,
        })
    }
}
