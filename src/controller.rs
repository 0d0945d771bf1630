//! Worker supervision: one child process per device, the shared phase, and
//! the session queues.
//!
//! The controller is the single writer of the phase. Workers never change
//! it, and nothing outside the controller may send phase commands. The
//! queues cross the process boundary as line-JSON pipes: one reader task
//! per child feeds the in-process `generated`/`validated` channels, and
//! peer batches are dispatched to workers round-robin.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::batch::ProofBatch;
use crate::config::Device;
use crate::ipc::{WorkerCommand, WorkerEvent, WorkerSpec};
use crate::params::ParamsError;
use crate::phase::{Phase, SharedPhase};
use crate::session::{NodeTopology, Session};

/// Soft deadline for a worker to exit after STOP.
const STOP_SOFT_DEADLINE: Duration = Duration::from_secs(10);
/// Further grace before the worker is killed outright.
const STOP_GRACE: Duration = Duration::from_secs(20);
/// Deadline for handing a peer batch to a worker's control pipe.
const INGRESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Controller-level failures.
#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("failed to spawn worker on {device}: {source}")]
    Spawn { device: Device, source: io::Error },
    #[error("worker control pipe failed: {0}")]
    Command(io::Error),
    #[error("validation ingress timed out")]
    Backpressure,
    #[error("no workers are running")]
    NotRunning,
    #[error(transparent)]
    InvalidParams(#[from] ParamsError),
}

/// Spawns worker processes from this binary's hidden `worker` subcommand.
///
/// Tests point it at `CARGO_BIN_EXE`-provided binaries; the service uses
/// its own executable.
#[derive(Debug, Clone, Default)]
pub struct WorkerLauncher {
    program: Option<PathBuf>,
}

impl WorkerLauncher {
    pub fn with_program(program: PathBuf) -> Self {
        Self {
            program: Some(program),
        }
    }

    fn spawn(&self) -> io::Result<Child> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Command::new(program)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Receiver ends of the session queues, shared between the controller's
/// non-blocking drains and the sender's consuming loop.
#[derive(Clone)]
pub struct OutputQueues {
    pub generated: Arc<Mutex<UnboundedReceiver<ProofBatch>>>,
    pub validated: Arc<Mutex<UnboundedReceiver<ProofBatch>>>,
}

impl OutputQueues {
    /// Drains everything currently queued without blocking. Returns empty
    /// when the queue is busy with its consumer.
    pub fn drain(queue: &Arc<Mutex<UnboundedReceiver<ProofBatch>>>) -> Vec<ProofBatch> {
        let mut batches = Vec::new();
        if let Ok(mut receiver) = queue.try_lock() {
            while let Ok(batch) = receiver.try_recv() {
                batches.push(batch);
            }
        }
        batches
    }
}

struct WorkerHandle {
    device: Device,
    child: Child,
    stdin: Option<ChildStdin>,
    ready: Arc<AtomicBool>,
    _reader: JoinHandle<()>,
}

impl WorkerHandle {
    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"));
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// STOP has been broadcast; join with escalation. In-flight compute is
    /// awaited rather than aborted, hence the generous soft deadline.
    async fn shutdown(&mut self) {
        // EOF on the control pipe doubles as a stop signal.
        self.stdin.take();
        if timeout(STOP_SOFT_DEADLINE, self.child.wait()).await.is_ok() {
            return;
        }
        warn!(device = %self.device, "worker did not stop in time");
        if timeout(STOP_GRACE, self.child.wait()).await.is_ok() {
            return;
        }
        error!(device = %self.device, "worker ignored stop, killing it");
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// One worker process per device plus the shared session state.
pub struct ParallelController {
    session: Session,
    topology: NodeTopology,
    devices: Vec<Device>,
    launcher: WorkerLauncher,
    phase: SharedPhase,
    workers: Vec<WorkerHandle>,
    generated_tx: UnboundedSender<ProofBatch>,
    validated_tx: UnboundedSender<ProofBatch>,
    outputs: OutputQueues,
    next_validate: AtomicUsize,
}

impl ParallelController {
    pub fn new(
        session: Session,
        topology: NodeTopology,
        devices: Vec<Device>,
        launcher: WorkerLauncher,
    ) -> Result<Self, ControllerError> {
        session.params.validate()?;
        let (generated_tx, generated_rx) = unbounded_channel();
        let (validated_tx, validated_rx) = unbounded_channel();
        Ok(Self {
            session,
            topology,
            devices,
            launcher,
            phase: SharedPhase::new(Phase::Idle),
            workers: Vec::new(),
            generated_tx,
            validated_tx,
            outputs: OutputQueues {
                generated: Arc::new(Mutex::new(generated_rx)),
                validated: Arc::new(Mutex::new(validated_rx)),
            },
            next_validate: AtomicUsize::new(0),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn outputs(&self) -> OutputQueues {
        self.outputs.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase.load()
    }

    /// Spawns every worker and hands each its session spec. Idempotent:
    /// calling it on a started controller does nothing.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        if !self.workers.is_empty() {
            return Ok(());
        }
        let device_count = self.devices.len() as u32;
        for (device_id, device) in self.devices.clone().into_iter().enumerate() {
            let mut child = self
                .launcher
                .spawn()
                .map_err(|source| ControllerError::Spawn { device, source })?;
            let stdin = child.stdin.take().ok_or_else(|| ControllerError::Spawn {
                device,
                source: io::Error::other("worker stdin was not piped"),
            })?;
            let stdout = child.stdout.take().ok_or_else(|| ControllerError::Spawn {
                device,
                source: io::Error::other("worker stdout was not piped"),
            })?;

            let ready = Arc::new(AtomicBool::new(false));
            let reader = spawn_event_reader(
                device,
                stdout,
                ready.clone(),
                self.generated_tx.clone(),
                self.validated_tx.clone(),
            );
            let mut handle = WorkerHandle {
                device,
                child,
                stdin: Some(stdin),
                ready,
                _reader: reader,
            };

            let spec = WorkerSpec {
                session: self.session.clone(),
                device,
                node_id: self.topology.node_id,
                node_count: self.topology.node_count,
                device_id: device_id as u32,
                device_count,
            };
            let line = serde_json::to_string(&spec).map_err(|err| ControllerError::Spawn {
                device,
                source: io::Error::other(err),
            })?;
            handle
                .send_line(&line)
                .await
                .map_err(ControllerError::Command)?;
            self.workers.push(handle);
        }
        info!(workers = self.workers.len(), "worker processes spawned");
        Ok(())
    }

    /// Single-writer phase transition, fanned out to every worker.
    async fn set_phase(&mut self, phase: Phase) {
        self.phase.store(phase);
        info!(%phase, "phase changed");
        let command = match serde_json::to_string(&WorkerCommand::Phase { phase }) {
            Ok(command) => command,
            Err(err) => {
                error!(%err, "failed to encode phase command");
                return;
            }
        };
        for worker in &mut self.workers {
            if let Err(err) = worker.send_line(&command).await {
                warn!(device = %worker.device, %err, "failed to deliver phase command");
            }
        }
    }

    pub async fn start_generate(&mut self) {
        self.set_phase(Phase::Generate).await;
    }

    pub async fn stop_generate(&mut self) {
        self.set_phase(Phase::Idle).await;
    }

    pub async fn start_validate(&mut self) {
        self.set_phase(Phase::Validate).await;
    }

    pub async fn stop_validate(&mut self) {
        self.set_phase(Phase::Idle).await;
    }

    /// Enqueues a peer batch for validation on the next worker in line.
    pub async fn to_validate(&mut self, batch: ProofBatch) -> Result<(), ControllerError> {
        if self.workers.is_empty() {
            return Err(ControllerError::NotRunning);
        }
        let index = self.next_validate.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let command = serde_json::to_string(&WorkerCommand::Validate { batch })
            .map_err(|err| ControllerError::Command(io::Error::other(err)))?;
        let worker = &mut self.workers[index];
        match timeout(INGRESS_TIMEOUT, worker.send_line(&command)).await {
            Err(_) => Err(ControllerError::Backpressure),
            Ok(Err(err)) => Err(ControllerError::Command(err)),
            Ok(Ok(())) => Ok(()),
        }
    }

    pub fn get_generated(&self) -> Vec<ProofBatch> {
        OutputQueues::drain(&self.outputs.generated)
    }

    pub fn get_validated(&self) -> Vec<ProofBatch> {
        OutputQueues::drain(&self.outputs.validated)
    }

    /// True while every worker process is alive. A controller with a dead
    /// worker is degraded and must be stopped.
    pub fn is_running(&mut self) -> bool {
        !self.workers.is_empty() && self.workers.iter_mut().all(WorkerHandle::is_alive)
    }

    /// True once every worker has signaled model init.
    pub fn is_model_initialized(&self) -> bool {
        !self.workers.is_empty()
            && self
                .workers
                .iter()
                .all(|worker| worker.ready.load(Ordering::SeqCst))
    }

    /// STOP to all workers, then join each with the 10 s / 30 s escalation.
    /// Shutdowns run concurrently so total stop latency is bounded by the
    /// slowest worker, not the device count. Queues are discarded with the
    /// controller; nothing is drained.
    pub async fn stop(&mut self) {
        self.set_phase(Phase::Stop).await;
        let shutdowns: Vec<_> = self
            .workers
            .drain(..)
            .map(|mut worker| tokio::spawn(async move { worker.shutdown().await }))
            .collect();
        for shutdown in shutdowns {
            if let Err(err) = shutdown.await {
                warn!(%err, "worker shutdown task failed");
            }
        }
        info!("controller stopped");
    }
}

fn spawn_event_reader(
    device: Device,
    stdout: ChildStdout,
    ready: Arc<AtomicBool>,
    generated_tx: UnboundedSender<ProofBatch>,
    validated_tx: UnboundedSender<ProofBatch>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WorkerEvent>(&line) {
                        Ok(WorkerEvent::Ready) => {
                            info!(%device, "worker model initialized");
                            ready.store(true, Ordering::SeqCst);
                        }
                        Ok(WorkerEvent::Generated { batch }) => {
                            let _ = generated_tx.send(batch);
                        }
                        Ok(WorkerEvent::Validated { batch }) => {
                            let _ = validated_tx.send(batch);
                        }
                        Ok(WorkerEvent::Error { message }) => {
                            warn!(%device, %message, "worker reported an error");
                        }
                        Err(err) => {
                            warn!(%device, %err, "unparseable worker event");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%device, %err, "worker event pipe failed");
                    break;
                }
            }
        }
    })
}
