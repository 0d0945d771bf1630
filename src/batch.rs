//! Proof batches and their validation records.
//!
//! A [`ProofBatch`] is a tag-homogeneous vector of `(nonce, distance)` pairs:
//! every entry belongs to the same `(public_key, block_hash, block_height)`
//! tuple. Batches are created once and never mutated after emission; the
//! operations here all build new batches.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::fraud;

/// A batch of candidate proofs submitted by (or generated for) one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofBatch {
    pub public_key: String,
    pub block_hash: String,
    pub block_height: u64,
    pub nonces: Vec<u64>,
    pub dist: Vec<f32>,
}

/// Violation of the batch invariants by a received payload.
///
/// These are malformed submissions, not fraud signals: a batch that fails
/// here is dropped without being scored.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    #[error("nonce and distance lengths differ ({nonces} vs {dist})")]
    LengthMismatch { nonces: usize, dist: usize },
    #[error("merged batches carry different tags ({left} vs {right})")]
    TagMismatch { left: String, right: String },
    #[error("claimed distance {dist} for nonce {nonce} is not below r_target {r_target}")]
    ClaimAboveTarget {
        nonce: u64,
        dist: f32,
        r_target: f64,
    },
}

impl ProofBatch {
    /// An empty batch with empty tags, the identity element of [`merge`](Self::merge).
    pub fn empty() -> Self {
        Self {
            public_key: String::new(),
            block_hash: String::new(),
            block_height: 0,
            nonces: Vec::new(),
            dist: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }

    /// The `(public_key, block_hash, block_height)` tag shared by all entries.
    pub fn tag(&self) -> (&str, &str, u64) {
        (&self.public_key, &self.block_hash, self.block_height)
    }

    /// Checks the length invariant of a received payload.
    pub fn check(&self) -> Result<(), BatchError> {
        if self.nonces.len() != self.dist.len() {
            return Err(BatchError::LengthMismatch {
                nonces: self.nonces.len(),
                dist: self.dist.len(),
            });
        }
        Ok(())
    }

    /// Entries whose distance is strictly below `r_target`.
    pub fn sub_batch(&self, r_target: f64) -> ProofBatch {
        let mut nonces = Vec::new();
        let mut dist = Vec::new();
        for (&nonce, &d) in self.nonces.iter().zip(&self.dist) {
            if (d as f64) < r_target {
                nonces.push(nonce);
                dist.push(d);
            }
        }
        ProofBatch {
            public_key: self.public_key.clone(),
            block_hash: self.block_hash.clone(),
            block_height: self.block_height,
            nonces,
            dist,
        }
    }

    /// Splits into chunks of at most `batch_size`, preserving order and
    /// total length.
    pub fn split(&self, batch_size: usize) -> Vec<ProofBatch> {
        let mut chunks = Vec::new();
        let mut i = 0;
        while i < self.nonces.len() {
            let end = usize::min(i + batch_size, self.nonces.len());
            chunks.push(ProofBatch {
                public_key: self.public_key.clone(),
                block_hash: self.block_hash.clone(),
                block_height: self.block_height,
                nonces: self.nonces[i..end].to_vec(),
                dist: self.dist[i..end].to_vec(),
            });
            i = end;
        }
        chunks
    }

    /// Returns the batch reordered by ascending nonce. Idempotent.
    pub fn sort_by_nonce(&self) -> ProofBatch {
        let mut order: Vec<usize> = (0..self.nonces.len()).collect();
        order.sort_by_key(|&i| self.nonces[i]);
        ProofBatch {
            public_key: self.public_key.clone(),
            block_hash: self.block_hash.clone(),
            block_height: self.block_height,
            nonces: order.iter().map(|&i| self.nonces[i]).collect(),
            dist: order.iter().map(|&i| self.dist[i]).collect(),
        }
    }

    /// Concatenates tag-equal batches. Merging an empty slice yields
    /// [`ProofBatch::empty`].
    pub fn merge(batches: &[ProofBatch]) -> Result<ProofBatch, BatchError> {
        let Some(first) = batches.first() else {
            return Ok(ProofBatch::empty());
        };
        let mut merged = ProofBatch {
            public_key: first.public_key.clone(),
            block_hash: first.block_hash.clone(),
            block_height: first.block_height,
            nonces: Vec::new(),
            dist: Vec::new(),
        };
        for batch in batches {
            if batch.tag() != merged.tag() {
                return Err(BatchError::TagMismatch {
                    left: format!("{:?}", merged.tag()),
                    right: format!("{:?}", batch.tag()),
                });
            }
            merged.nonces.extend_from_slice(&batch.nonces);
            merged.dist.extend_from_slice(&batch.dist);
        }
        Ok(merged)
    }
}

/// A peer batch awaiting locally-recomputed distances.
///
/// Workers validate in `batch_size` chunks, so the recomputed distances for
/// one submission arrive piecemeal; this record accumulates them until the
/// batch's nonce set is fully covered.
#[derive(Debug, Clone)]
pub struct InValidation {
    batch: ProofBatch,
    recomputed: HashMap<u64, f32>,
}

impl InValidation {
    pub fn new(batch: ProofBatch) -> Self {
        Self {
            batch,
            recomputed: HashMap::new(),
        }
    }

    pub fn batch(&self) -> &ProofBatch {
        &self.batch
    }

    /// Records recomputed distances from a validated chunk. Chunks with a
    /// different tag are ignored.
    pub fn absorb(&mut self, chunk: &ProofBatch) {
        if chunk.tag() != self.batch.tag() {
            return;
        }
        for (&nonce, &d) in chunk.nonces.iter().zip(&chunk.dist) {
            self.recomputed.insert(nonce, d);
        }
    }

    /// True once every nonce of the pending batch has a recomputed distance.
    pub fn is_ready(&self) -> bool {
        self.batch
            .nonces
            .iter()
            .all(|n| self.recomputed.contains_key(n))
    }

    /// Builds the final [`ValidatedBatch`]. Call only when [`is_ready`](Self::is_ready).
    pub fn validated(
        &self,
        r_target: f64,
        fraud_threshold: f64,
    ) -> Result<ValidatedBatch, BatchError> {
        let computed = self
            .batch
            .nonces
            .iter()
            .map(|n| self.recomputed.get(n).copied().unwrap_or(f32::INFINITY))
            .collect();
        ValidatedBatch::new(&self.batch, computed, r_target, fraud_threshold)
    }
}

/// A [`ProofBatch`] augmented with locally-recomputed distances and the
/// fraud verdict shipped to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedBatch {
    pub public_key: String,
    pub block_hash: String,
    pub block_height: u64,
    pub nonces: Vec<u64>,
    /// Locally recomputed distances.
    pub dist: Vec<f32>,
    /// Distances as claimed by the submitter.
    pub received_dist: Vec<f32>,
    pub r_target: f64,
    pub n_invalid: usize,
    pub probability_honest: f64,
    pub fraud_detected: bool,
    pub fraud_threshold: f64,
}

impl ValidatedBatch {
    /// Scores a received batch against its recomputed distances.
    ///
    /// Every claimed distance must be below `r_target` (the submitter claimed
    /// each entry was a proof); a violation is a protocol error and the batch
    /// must not be scored. `n_invalid` counts entries whose recomputed
    /// distance exceeds `r_target`.
    pub fn new(
        received: &ProofBatch,
        computed: Vec<f32>,
        r_target: f64,
        fraud_threshold: f64,
    ) -> Result<Self, BatchError> {
        received.check()?;
        if computed.len() != received.nonces.len() {
            return Err(BatchError::LengthMismatch {
                nonces: received.nonces.len(),
                dist: computed.len(),
            });
        }
        for (&nonce, &claimed) in received.nonces.iter().zip(&received.dist) {
            if (claimed as f64) >= r_target {
                return Err(BatchError::ClaimAboveTarget {
                    nonce,
                    dist: claimed,
                    r_target,
                });
            }
        }
        let n_invalid = computed.iter().filter(|&&d| (d as f64) > r_target).count();
        let probability_honest = fraud::probability_honest(received.len(), n_invalid);
        Ok(Self {
            public_key: received.public_key.clone(),
            block_hash: received.block_hash.clone(),
            block_height: received.block_height,
            nonces: received.nonces.clone(),
            dist: computed,
            received_dist: received.dist.clone(),
            r_target,
            n_invalid,
            probability_honest,
            fraud_detected: probability_honest < fraud_threshold,
            fraud_threshold,
        })
    }
}
