//! Background egress: drains the session queues, scores validated batches
//! and ships everything to the configured sink.
//!
//! Delivery is at-least-once: HTTP failures back off per endpoint
//! (1 s doubling to a 30 s cap) and nothing is ever dropped, queue memory
//! being the only bound. The sink deduplicates by
//! `(public_key, block_hash, nonce)`, so duplicates are harmless while a
//! lost proof costs rewards.

use reqwest::Client;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::batch::{BatchError, InValidation, ProofBatch, ValidatedBatch};
use crate::controller::OutputQueues;

const DRAIN_INTERVAL: Duration = Duration::from_millis(200);
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on pending in-validation records, evicted oldest-first.
const REGISTRY_CAP: usize = 10_000;

/// Sink endpoint and scoring parameters for one session.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub sink: Url,
    pub r_target: f64,
    pub fraud_threshold: f64,
}

/// Handle to the background egress task.
pub struct Sender {
    task: JoinHandle<()>,
    registry_tx: UnboundedSender<ProofBatch>,
    cancel: CancellationToken,
}

impl Sender {
    /// Starts the egress loop over the session's output queues.
    pub fn spawn(config: SenderConfig, outputs: OutputQueues) -> Sender {
        let cancel = CancellationToken::new();
        let (registry_tx, registry_rx) = unbounded_channel();
        let task = tokio::spawn(run(config, outputs, registry_rx, cancel.clone()));
        Sender {
            task,
            registry_tx,
            cancel,
        }
    }

    /// Registers a peer batch accepted for validation; the eventual
    /// recomputed chunks will be matched against it.
    pub fn register(&self, batch: ProofBatch) {
        let _ = self.registry_tx.send(batch);
    }

    /// Cancels the loop and waits briefly for it to wind down.
    pub async fn stop(self) {
        self.cancel.cancel();
        if timeout(STOP_TIMEOUT, self.task).await.is_err() {
            warn!("sender did not stop within the timeout period");
        }
    }
}

async fn run(
    config: SenderConfig,
    outputs: OutputQueues,
    mut registry_rx: UnboundedReceiver<ProofBatch>,
    cancel: CancellationToken,
) {
    let client = Client::new();
    let mut registry = ValidationRegistry::new(REGISTRY_CAP);
    let mut generated = Egress::new(endpoint(&config.sink, "generated"));
    let mut validated = Egress::new(endpoint(&config.sink, "validated"));
    let mut ticker = interval(DRAIN_INTERVAL);
    info!(sink = %config.sink, "sender started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(batch) = registry_rx.recv() => registry.insert(batch),
            _ = ticker.tick() => {
                collect_generated(&outputs, &mut generated);
                collect_validated(&outputs, &config, &mut registry, &mut validated);
                generated.flush(&client).await;
                validated.flush(&client).await;
            }
        }
    }
    info!("sender stopped");
}

/// Drains freshly generated batches and merges them per submitter before
/// posting.
fn collect_generated(outputs: &OutputQueues, egress: &mut Egress<ProofBatch>) {
    let drained = OutputQueues::drain(&outputs.generated);
    if drained.is_empty() {
        return;
    }
    let mut groups: HashMap<(String, String, u64), Vec<ProofBatch>> = HashMap::new();
    for batch in drained {
        let key = (
            batch.public_key.clone(),
            batch.block_hash.clone(),
            batch.block_height,
        );
        groups.entry(key).or_default().push(batch);
    }
    for group in groups.into_values() {
        match ProofBatch::merge(&group) {
            Ok(merged) if !merged.is_empty() => {
                debug!(proofs = merged.len(), "queueing generated batch");
                egress.push(merged);
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "dropping unmergeable generated group"),
        }
    }
}

/// Matches recomputed chunks against the in-validation registry and queues
/// completed batches with their fraud verdicts.
fn collect_validated(
    outputs: &OutputQueues,
    config: &SenderConfig,
    registry: &mut ValidationRegistry,
    egress: &mut Egress<ValidatedBatch>,
) {
    for chunk in OutputQueues::drain(&outputs.validated) {
        match registry.absorb(&chunk, config.r_target, config.fraud_threshold) {
            Some(Ok(batch)) => {
                info!(
                    submitter = %batch.public_key,
                    n_invalid = batch.n_invalid,
                    probability_honest = batch.probability_honest,
                    fraud = batch.fraud_detected,
                    "validation complete"
                );
                egress.push(batch);
            }
            Some(Err(err)) => {
                // Malformed submission: dropped without a fraud verdict.
                warn!(%err, submitter = %chunk.public_key, "protocol violation in validated batch");
            }
            None => {}
        }
    }
}

fn endpoint(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(suffix);
    }
    url
}

/// Pending in-validation records keyed by `(public_key, block_hash)`,
/// bounded by evicting the oldest entry.
struct ValidationRegistry {
    cap: usize,
    entries: HashMap<(String, String), InValidation>,
    order: VecDeque<(String, String)>,
}

impl ValidationRegistry {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, batch: ProofBatch) {
        if let Err(err) = batch.check() {
            warn!(%err, "refusing malformed batch for validation tracking");
            return;
        }
        let key = (batch.public_key.clone(), batch.block_hash.clone());
        if self.entries.insert(key.clone(), InValidation::new(batch)).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.cap {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            warn!(submitter = %oldest.0, "evicting incomplete validation record");
            self.entries.remove(&oldest);
        }
    }

    fn absorb(
        &mut self,
        chunk: &ProofBatch,
        r_target: f64,
        fraud_threshold: f64,
    ) -> Option<Result<ValidatedBatch, BatchError>> {
        let key = (chunk.public_key.clone(), chunk.block_hash.clone());
        let entry = self.entries.get_mut(&key)?;
        entry.absorb(chunk);
        if !entry.is_ready() {
            return None;
        }
        let result = entry.validated(r_target, fraud_threshold);
        self.entries.remove(&key);
        self.order.retain(|k| *k != key);
        Some(result)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One sink endpoint with its pending queue and backoff state.
struct Egress<T> {
    url: Url,
    pending: VecDeque<T>,
    backoff: Duration,
    next_attempt: Option<Instant>,
}

impl<T: Serialize> Egress<T> {
    fn new(url: Url) -> Self {
        Self {
            url,
            pending: VecDeque::new(),
            backoff: BACKOFF_START,
            next_attempt: None,
        }
    }

    fn push(&mut self, item: T) {
        self.pending.push_back(item);
    }

    /// Posts queued payloads in order until empty or a failure arms the
    /// backoff. Failed payloads stay at the front and are retried.
    async fn flush(&mut self, client: &Client) {
        while let Some(item) = self.pending.front() {
            if let Some(at) = self.next_attempt {
                if Instant::now() < at {
                    return;
                }
            }
            let outcome = client.post(self.url.clone()).json(item).send().await;
            match outcome {
                Ok(response) if response.status().is_success() => {
                    self.pending.pop_front();
                    self.backoff = BACKOFF_START;
                    self.next_attempt = None;
                }
                Ok(response) => {
                    warn!(url = %self.url, status = %response.status(), pending = self.pending.len(), "sink rejected payload, backing off");
                    self.arm_backoff();
                    return;
                }
                Err(err) => {
                    warn!(url = %self.url, %err, pending = self.pending.len(), "sink unreachable, backing off");
                    self.arm_backoff();
                    return;
                }
            }
        }
    }

    fn arm_backoff(&mut self) {
        self.next_attempt = Some(Instant::now() + self.backoff);
        self.backoff = Duration::min(self.backoff * 2, BACKOFF_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(key: &str, hash: &str, nonces: Vec<u64>, dist: Vec<f32>) -> ProofBatch {
        ProofBatch {
            public_key: key.into(),
            block_hash: hash.into(),
            block_height: 1,
            nonces,
            dist,
        }
    }

    #[test]
    fn endpoint_joins_paths() {
        let base: Url = "http://sink.example:9000".parse().unwrap();
        assert_eq!(
            endpoint(&base, "generated").as_str(),
            "http://sink.example:9000/generated"
        );
        let prefixed: Url = "http://sink.example:9000/hook/".parse().unwrap();
        assert_eq!(
            endpoint(&prefixed, "validated").as_str(),
            "http://sink.example:9000/hook/validated"
        );
    }

    #[test]
    fn registry_completes_after_all_chunks() {
        let mut registry = ValidationRegistry::new(10);
        registry.insert(batch("a", "0x1", vec![1, 2, 3], vec![0.1, 0.2, 0.3]));

        assert!(
            registry
                .absorb(&batch("a", "0x1", vec![1], vec![0.15]), 1.0, 0.01)
                .is_none()
        );
        let done = registry
            .absorb(&batch("a", "0x1", vec![2, 3], vec![0.25, 0.35]), 1.0, 0.01)
            .expect("record complete")
            .expect("well-formed batch");
        assert_eq!(done.nonces, vec![1, 2, 3]);
        assert_eq!(done.n_invalid, 0);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn registry_ignores_unknown_chunks() {
        let mut registry = ValidationRegistry::new(10);
        assert!(
            registry
                .absorb(&batch("a", "0x1", vec![1], vec![0.1]), 1.0, 0.01)
                .is_none()
        );
    }

    #[test]
    fn registry_reports_protocol_violations() {
        let mut registry = ValidationRegistry::new(10);
        // Claimed distance 1.5 is not below the target 1.0.
        registry.insert(batch("a", "0x1", vec![1], vec![1.5]));
        let result = registry
            .absorb(&batch("a", "0x1", vec![1], vec![0.5]), 1.0, 0.01)
            .expect("record complete");
        assert!(matches!(result, Err(BatchError::ClaimAboveTarget { .. })));
    }

    #[test]
    fn registry_evicts_oldest_over_cap() {
        let mut registry = ValidationRegistry::new(2);
        registry.insert(batch("a", "0x1", vec![1], vec![0.1]));
        registry.insert(batch("b", "0x1", vec![2], vec![0.1]));
        registry.insert(batch("c", "0x1", vec![3], vec![0.1]));
        assert_eq!(registry.len(), 2);
        // "a" was evicted; its chunks no longer match anything.
        assert!(
            registry
                .absorb(&batch("a", "0x1", vec![1], vec![0.1]), 1.0, 0.01)
                .is_none()
        );
    }

    #[test]
    fn resubmission_replaces_the_pending_record() {
        let mut registry = ValidationRegistry::new(10);
        registry.insert(batch("a", "0x1", vec![1], vec![0.1]));
        registry.insert(batch("a", "0x1", vec![1, 2], vec![0.1, 0.2]));
        assert_eq!(registry.len(), 1);
        assert!(
            registry
                .absorb(&batch("a", "0x1", vec![1], vec![0.1]), 1.0, 0.01)
                .is_none()
        );
        assert!(
            registry
                .absorb(&batch("a", "0x1", vec![2], vec![0.2]), 1.0, 0.01)
                .is_some()
        );
    }
}
