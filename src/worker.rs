//! The per-device worker process.
//!
//! A worker owns one [`Compute`] and one slice of the nonce space. It runs
//! as a child process of the control plane (the same binary, re-executed
//! with the hidden `worker` subcommand) so that each device gets its own
//! context and allocator arena, and so that STOP can always reclaim it.
//!
//! The loop polls the process-local phase cell and dispatches: generation
//! pipelines forward passes against batch finalization, validation drains
//! peer batches, regroups them per submitter and recomputes distances.
//! Publishing to the controller goes through a bounded channel with a timed
//! send; a timeout there means nothing downstream is draining, which aborts
//! the generate phase until the controller switches phases.

use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::io::{self, BufReader, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::batch::ProofBatch;
use crate::compute::{Compute, ComputeError};
use crate::ipc::{self, WorkerCommand, WorkerEvent, WorkerSpec};
use crate::model::WeightInitError;
use crate::nonce::NonceIterator;
use crate::phase::{Phase, SharedPhase};

const IDLE_POLL: Duration = Duration::from_millis(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const VALIDATE_DRAIN_WINDOW: Duration = Duration::from_secs(1);
const EVENT_QUEUE_DEPTH: usize = 64;

/// Fatal worker failure; the process exits non-zero.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("missing worker spec on stdin")]
    MissingSpec,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    WeightInit(#[from] WeightInitError),
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

/// Entry point of the `worker` subcommand: reads the spec line from stdin,
/// then hands stdin/stdout to the worker loop.
pub fn run_stdio() -> Result<(), WorkerError> {
    let mut reader = BufReader::new(io::stdin());
    let spec: WorkerSpec = ipc::read_line(&mut reader)?.ok_or(WorkerError::MissingSpec)?;
    run(spec, reader, io::stdout())
}

fn run<R, W>(spec: WorkerSpec, reader: R, mut stdout: W) -> Result<(), WorkerError>
where
    R: io::BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    let span = tracing::info_span!("worker", device = %spec.device, id = spec.device_id);
    let _guard = span.enter();

    info!("initializing model");
    let compute = match Compute::new(spec.session.clone()) {
        Ok(compute) => compute,
        Err(err) => {
            let _ = ipc::write_line(
                &mut stdout,
                &WorkerEvent::Error {
                    message: err.to_string(),
                },
            );
            return Err(err.into());
        }
    };
    info!("model initialized");

    let phase = SharedPhase::new(Phase::Idle);
    let (event_tx, event_rx) = crossbeam_channel::bounded::<WorkerEvent>(EVENT_QUEUE_DEPTH);
    let (validate_tx, validate_rx) = crossbeam_channel::unbounded::<ProofBatch>();

    let writer = spawn_stdout_writer(event_rx, stdout);
    spawn_stdin_reader(reader, phase.clone(), validate_tx);

    // One-shot model-init signal; the controller reports LOADING until it
    // has seen this from every worker.
    let _ = event_tx.send(WorkerEvent::Ready);

    let mut nonces = NonceIterator::new(
        spec.node_id,
        spec.node_count,
        spec.device_id,
        spec.device_count,
    );

    let result = worker_loop(&spec, &compute, &phase, &mut nonces, &validate_rx, &event_tx);

    drop(event_tx);
    let _ = writer.join();
    info!("worker stopped");
    result
}

fn worker_loop(
    spec: &WorkerSpec,
    compute: &Compute,
    phase: &SharedPhase,
    nonces: &mut NonceIterator,
    validate_rx: &Receiver<ProofBatch>,
    events: &Sender<WorkerEvent>,
) -> Result<(), WorkerError> {
    loop {
        match phase.load() {
            Phase::Stop => {
                info!("stop observed, leaving worker loop");
                return Ok(());
            }
            Phase::Generate => generate_phase(spec, compute, phase, nonces, events)?,
            Phase::Validate => validate_phase(spec, compute, phase, validate_rx, events),
            Phase::Idle => thread::sleep(IDLE_POLL),
        }
    }
}

/// Generation: compute distances for one nonce batch while the previous
/// batch is filtered and published on the finalizer thread, so the device
/// never idles between batches.
fn generate_phase(
    spec: &WorkerSpec,
    compute: &Compute,
    phase: &SharedPhase,
    nonces: &mut NonceIterator,
    events: &Sender<WorkerEvent>,
) -> Result<(), WorkerError> {
    info!("starting generate phase");
    let r_target = spec.session.r_target;
    let interrupt = AtomicBool::new(false);
    let stalled = AtomicBool::new(false);
    let failure: Mutex<Option<ComputeError>> = Mutex::new(None);
    let (raw_tx, raw_rx) = crossbeam_channel::bounded::<ProofBatch>(1);

    thread::scope(|scope| {
        let finalizer_events = events.clone();
        let interrupt_ref = &interrupt;
        let stalled_ref = &stalled;
        scope.spawn(move || {
            let mut stats = GenerateStats::default();
            for raw in raw_rx.iter() {
                let started = Instant::now();
                let filtered = raw.sub_batch(r_target);
                stats.record(raw.len(), filtered.len(), started.elapsed());
                if filtered.is_empty() {
                    continue;
                }
                let publish = finalizer_events
                    .send_timeout(WorkerEvent::Generated { batch: filtered }, PUBLISH_TIMEOUT);
                if publish.is_err() {
                    error!("publishing a generated batch timed out, aborting generate phase");
                    stalled_ref.store(true, Ordering::SeqCst);
                    interrupt_ref.store(true, Ordering::SeqCst);
                    break;
                }
            }
            stats.report();
        });

        while phase.load() == Phase::Generate && !interrupt.load(Ordering::SeqCst) {
            let batch_nonces = nonces.take_batch(spec.session.batch_size);
            match compute.generate(&batch_nonces) {
                Ok(raw) => {
                    // Finalizer gone means the phase is already aborting.
                    if raw_tx.send(raw).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(%err, "forward pass failed during generation");
                    *failure.lock().expect("failure slot poisoned") = Some(err);
                    interrupt.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
        drop(raw_tx);
    });

    if let Some(err) = failure.into_inner().expect("failure slot poisoned") {
        let _ = events.send(WorkerEvent::Error {
            message: err.to_string(),
        });
        return Err(err.into());
    }

    if stalled.load(Ordering::SeqCst) {
        // Backpressure: hold the phase aborted until the controller moves on.
        while phase.load() == Phase::Generate {
            thread::sleep(IDLE_POLL);
        }
    }
    Ok(())
}

/// Validation: drain pending peer batches, regroup per submitter into
/// `batch_size` chunks and recompute their distances.
fn validate_phase(
    spec: &WorkerSpec,
    compute: &Compute,
    phase: &SharedPhase,
    validate_rx: &Receiver<ProofBatch>,
    events: &Sender<WorkerEvent>,
) {
    info!("starting validate phase");
    while phase.load() == Phase::Validate {
        let chunks = prepare_chunks(validate_rx, spec.session.batch_size);
        if chunks.is_empty() {
            thread::sleep(IDLE_POLL);
            continue;
        }
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            debug!(index, total, len = chunk.len(), "validating chunk");
            match compute.validate(chunk) {
                Ok(validated) => {
                    let publish = events
                        .send_timeout(WorkerEvent::Validated { batch: validated }, PUBLISH_TIMEOUT);
                    if publish.is_err() {
                        warn!("publishing a validated chunk timed out, dropping it");
                    }
                }
                Err(err) => {
                    // The fraud pipeline tolerates missing chunks; the
                    // submitter will retry.
                    error!(%err, submitter = %chunk.public_key, "validation failed, dropping chunk");
                }
            }
        }
    }
    info!("validate phase stopped");
}

/// Drains the pending queue for up to a second (or until one submitter has
/// a full batch), then merges per submitter tag and splits into chunks of
/// `batch_size`.
fn prepare_chunks(validate_rx: &Receiver<ProofBatch>, batch_size: usize) -> Vec<ProofBatch> {
    let deadline = Instant::now() + VALIDATE_DRAIN_WINDOW;
    let mut groups: HashMap<(String, String, u64), Vec<ProofBatch>> = HashMap::new();
    let mut sizes: HashMap<(String, String, u64), usize> = HashMap::new();

    while Instant::now() < deadline {
        let Ok(batch) = validate_rx.try_recv() else {
            break;
        };
        let key = (
            batch.public_key.clone(),
            batch.block_hash.clone(),
            batch.block_height,
        );
        *sizes.entry(key.clone()).or_default() += batch.len();
        groups.entry(key).or_default().push(batch);
        if sizes.values().any(|&size| size >= batch_size) {
            break;
        }
    }

    let mut chunks = Vec::new();
    for (key, group) in groups {
        match ProofBatch::merge(&group) {
            Ok(merged) => chunks.extend(merged.split(batch_size)),
            Err(err) => {
                // Unreachable with tag-keyed groups; kept as a guard.
                error!(%err, submitter = %key.0, "dropping unmergeable validation group");
            }
        }
    }
    chunks
}

fn spawn_stdin_reader<R>(mut reader: R, phase: SharedPhase, validate_tx: Sender<ProofBatch>)
where
    R: io::BufRead + Send + 'static,
{
    thread::spawn(move || {
        loop {
            match ipc::read_line::<WorkerCommand, _>(&mut reader) {
                Ok(Some(WorkerCommand::Phase { phase: next })) => {
                    info!(phase = %next, "phase transition");
                    phase.store(next);
                }
                Ok(Some(WorkerCommand::Validate { batch })) => {
                    let _ = validate_tx.send(batch);
                }
                Ok(None) => {
                    // Controller hung up; treat as STOP.
                    info!("control pipe closed, stopping");
                    phase.store(Phase::Stop);
                    break;
                }
                Err(err) => {
                    error!(%err, "malformed control message, stopping");
                    phase.store(Phase::Stop);
                    break;
                }
            }
        }
    });
}

fn spawn_stdout_writer<W>(
    event_rx: Receiver<WorkerEvent>,
    mut stdout: W,
) -> thread::JoinHandle<()>
where
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        for event in event_rx.iter() {
            if ipc::write_line(&mut stdout, &event).is_err() {
                break;
            }
        }
    })
}

#[derive(Default)]
struct GenerateStats {
    batches: u64,
    nonces: u64,
    kept: u64,
    finalize: Duration,
}

impl GenerateStats {
    fn record(&mut self, raw: usize, kept: usize, finalize: Duration) {
        self.batches += 1;
        self.nonces += raw as u64;
        self.kept += kept as u64;
        self.finalize += finalize;
        debug!(
            batches = self.batches,
            nonces = self.nonces,
            kept = self.kept,
            "generated batch finalized"
        );
    }

    fn report(&self) {
        info!(
            batches = self.batches,
            nonces = self.nonces,
            kept = self.kept,
            finalize_ms = self.finalize.as_millis() as u64,
            "generate phase summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(key: &str, nonces: Vec<u64>) -> ProofBatch {
        ProofBatch {
            public_key: key.into(),
            block_hash: "0xabc".into(),
            block_height: 1,
            dist: vec![0.5; nonces.len()],
            nonces,
        }
    }

    #[test]
    fn prepare_chunks_groups_by_submitter_and_splits() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(batch("a", vec![1, 2, 3])).unwrap();
        tx.send(batch("b", vec![10])).unwrap();
        tx.send(batch("a", vec![4, 5])).unwrap();

        let chunks = prepare_chunks(&rx, 2);
        let a_total: usize = chunks
            .iter()
            .filter(|c| c.public_key == "a")
            .map(ProofBatch::len)
            .sum();
        let b_total: usize = chunks
            .iter()
            .filter(|c| c.public_key == "b")
            .map(ProofBatch::len)
            .sum();
        assert_eq!(a_total, 5);
        assert_eq!(b_total, 1);
        assert!(chunks.iter().all(|c| c.len() <= 2));
    }

    #[test]
    fn prepare_chunks_stops_at_a_full_batch() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(batch("a", vec![1, 2, 3])).unwrap();
        tx.send(batch("a", vec![4, 5, 6])).unwrap();

        let chunks = prepare_chunks(&rx, 3);
        // The first batch already fills a chunk; the second stays queued.
        assert_eq!(chunks.iter().map(ProofBatch::len).sum::<usize>(), 3);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn prepare_chunks_returns_nothing_when_idle() {
        let (_tx, rx) = crossbeam_channel::unbounded::<ProofBatch>();
        assert!(prepare_chunks(&rx, 10).is_empty());
    }
}
