//! Single-writer orchestration of the GPU tenants and the PoW lifecycle.
//!
//! The manager is the only component allowed to create or destroy the PoW
//! controller and the only one that may change tenancy: PoW, the inference
//! runner and the training runner never share the GPU. All HTTP mutation
//! paths funnel through here behind one async mutex, which is what makes
//! the lifecycle single-writer.

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::batch::{BatchError, ProofBatch};
use crate::config::Config;
use crate::controller::{ControllerError, ParallelController, WorkerLauncher};
use crate::params::Params;
use crate::phase::{Phase, PowState};
use crate::runner::ExternalRunner;
use crate::sender::{Sender, SenderConfig};
use crate::session::{NodeTopology, Session};

/// Body of the `/pow/init` family of endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowInitRequest {
    /// Sink base URL for generated and validated batches.
    pub url: Url,
    pub block_hash: String,
    pub block_height: u64,
    pub public_key: String,
    pub batch_size: usize,
    pub r_target: f64,
    pub fraud_threshold: f64,
    #[serde(default)]
    pub params: Params,
}

/// Response of every `/pow` control endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowStatusResponse {
    pub status: PowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_model_initialized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl PowStatusResponse {
    fn of(status: PowState) -> Self {
        Self {
            status,
            is_model_initialized: None,
            details: None,
        }
    }
}

/// Failures surfaced to the HTTP layer; the mapping to status codes lives
/// with the handlers.
#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("pow controller already initialized")]
    AlreadyInitialized,
    #[error("pow controller not initialized")]
    NotInitialized,
    #[error("gpu is owned by the {tenant} tenant")]
    ResourceConflict { tenant: &'static str },
    #[error("model is still loading")]
    ModelLoading,
    #[error("a worker process died; the controller was torn down")]
    Degraded,
    #[error(transparent)]
    Protocol(#[from] BatchError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("failed to start the {tenant} runner: {source}")]
    Runner {
        tenant: &'static str,
        source: io::Error,
    },
}

struct PowEngine {
    controller: ParallelController,
    sender: Sender,
}

/// Shared manager handle used as axum state.
pub type SharedManager = Arc<Mutex<Manager>>;

pub struct Manager {
    config: Config,
    launcher: WorkerLauncher,
    pow: Option<PowEngine>,
    inference: Option<ExternalRunner>,
    training: Option<ExternalRunner>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            launcher: WorkerLauncher::default(),
            pow: None,
            inference: None,
            training: None,
        }
    }

    /// Overrides how worker processes are spawned; integration tests point
    /// this at the compiled binary.
    pub fn with_launcher(mut self, launcher: WorkerLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn into_shared(self) -> SharedManager {
        Arc::new(Mutex::new(self))
    }

    fn is_pow_running(&mut self) -> bool {
        match self.pow.as_mut() {
            Some(engine) => engine.controller.is_running(),
            None => false,
        }
    }

    fn running_tenant(&mut self) -> Option<&'static str> {
        if let Some(runner) = self.inference.as_mut() {
            if runner.is_running() {
                return Some(runner.name());
            }
        }
        if let Some(runner) = self.training.as_mut() {
            if runner.is_running() {
                return Some(runner.name());
            }
        }
        None
    }

    /// Constructs and starts the controller and sender for a new session.
    /// Phase starts at IDLE; the response reports LOADING while workers
    /// build their models.
    pub async fn init_pow(
        &mut self,
        request: PowInitRequest,
    ) -> Result<PowStatusResponse, ManagerError> {
        if self.pow.is_some() {
            return Err(ManagerError::AlreadyInitialized);
        }
        if let Some(tenant) = self.running_tenant() {
            return Err(ManagerError::ResourceConflict { tenant });
        }

        let session = Session {
            block_hash: request.block_hash,
            block_height: request.block_height,
            public_key: request.public_key,
            batch_size: request.batch_size,
            r_target: request.r_target,
            fraud_threshold: request.fraud_threshold,
            params: request.params,
        };
        let topology = NodeTopology {
            node_id: self.config.node_id,
            node_count: self.config.node_count,
        };
        info!(
            block_hash = %session.block_hash,
            block_height = session.block_height,
            batch_size = session.batch_size,
            r_target = session.r_target,
            "initializing pow session"
        );
        let mut controller = ParallelController::new(
            session,
            topology,
            self.config.devices.clone(),
            self.launcher.clone(),
        )?;
        controller.start().await?;
        let sender = Sender::spawn(
            SenderConfig {
                sink: request.url,
                r_target: controller.session().r_target,
                fraud_threshold: controller.session().fraud_threshold,
            },
            controller.outputs(),
        );
        self.pow = Some(PowEngine { controller, sender });
        Ok(PowStatusResponse::of(PowState::Loading))
    }

    /// Stops whichever tenant currently owns the GPU, then init+start PoW.
    pub async fn switch_to_pow(
        &mut self,
        request: PowInitRequest,
    ) -> Result<PowStatusResponse, ManagerError> {
        if self.pow.is_some() {
            info!("stopping pow engine before re-init");
            self.stop_pow().await?;
        }
        if let Some(runner) = self.inference.as_mut() {
            if runner.is_running() {
                info!("stopping inference runner for pow");
                runner.stop().await;
            }
        }
        if let Some(runner) = self.training.as_mut() {
            if runner.is_running() {
                info!("stopping training runner for pow");
                runner.stop().await;
            }
        }
        self.init_pow(request).await
    }

    /// Idempotent init followed by the generate phase.
    pub async fn init_generate(
        &mut self,
        request: PowInitRequest,
    ) -> Result<PowStatusResponse, ManagerError> {
        if self.pow.is_none() {
            self.init_pow(request).await?;
        }
        self.start_generation().await
    }

    /// Idempotent init followed by the validate phase.
    pub async fn init_validate(
        &mut self,
        request: PowInitRequest,
    ) -> Result<PowStatusResponse, ManagerError> {
        if self.pow.is_none() {
            self.init_pow(request).await?;
        }
        self.start_validation().await
    }

    pub async fn start_generation(&mut self) -> Result<PowStatusResponse, ManagerError> {
        let engine = self.pow.as_mut().ok_or(ManagerError::NotInitialized)?;
        engine.controller.start_generate().await;
        Ok(engine_response(engine, PowState::Generating))
    }

    pub async fn start_validation(&mut self) -> Result<PowStatusResponse, ManagerError> {
        let engine = self.pow.as_mut().ok_or(ManagerError::NotInitialized)?;
        engine.controller.start_validate().await;
        Ok(engine_response(engine, PowState::Validating))
    }

    /// Accepts a peer batch: queues it for validation and registers it with
    /// the sender so the recomputed chunks can be reassembled and scored.
    pub async fn submit_validation(&mut self, batch: ProofBatch) -> Result<(), ManagerError> {
        batch.check()?;
        let engine = self.pow.as_mut().ok_or(ManagerError::NotInitialized)?;
        if !engine.controller.is_model_initialized() {
            return Err(ManagerError::ModelLoading);
        }
        engine.sender.register(batch.clone());
        engine.controller.to_validate(batch).await?;
        Ok(())
    }

    /// Reported engine state. A controller that lost a worker is degraded:
    /// it is torn down here and the caller sees the failure.
    pub async fn status(&mut self) -> Result<PowStatusResponse, ManagerError> {
        if self.pow.is_none() {
            return Ok(PowStatusResponse::of(PowState::NoController));
        }
        if !self.is_pow_running() {
            warn!("worker process died unexpectedly, tearing the engine down");
            self.stop_pow().await?;
            return Err(ManagerError::Degraded);
        }
        let Some(engine) = self.pow.as_mut() else {
            return Ok(PowStatusResponse::of(PowState::NoController));
        };
        let initialized = engine.controller.is_model_initialized();
        let phase = engine.controller.phase();
        let state = if !initialized && phase != Phase::Stop {
            PowState::Loading
        } else {
            PowState::from_phase(phase)
        };
        let mut response = PowStatusResponse::of(state);
        response.is_model_initialized = Some(initialized);
        if !initialized {
            response.details = Some("Model is still loading".to_string());
        }
        Ok(response)
    }

    /// Clean session teardown: STOP the workers, then the sender.
    pub async fn stop_pow(&mut self) -> Result<PowStatusResponse, ManagerError> {
        let mut engine = self.pow.take().ok_or(ManagerError::NotInitialized)?;
        engine.controller.stop().await;
        engine.sender.stop().await;
        Ok(PowStatusResponse::of(PowState::Stopped))
    }

    /// Hands the GPU to the inference runner; refused while PoW or training
    /// holds it.
    pub async fn start_inference(&mut self, runner: ExternalRunner) -> Result<(), ManagerError> {
        if self.is_pow_running() {
            return Err(ManagerError::ResourceConflict { tenant: "pow" });
        }
        if let Some(tenant) = self.running_tenant() {
            return Err(ManagerError::ResourceConflict { tenant });
        }
        let mut runner = runner;
        let tenant = runner.name();
        runner
            .start()
            .map_err(|source| ManagerError::Runner { tenant, source })?;
        self.inference = Some(runner);
        Ok(())
    }

    pub async fn stop_inference(&mut self) -> Result<(), ManagerError> {
        let mut runner = self.inference.take().ok_or(ManagerError::NotInitialized)?;
        runner.stop().await;
        Ok(())
    }

    /// Hands the GPU to the training runner; same exclusivity rules.
    pub async fn start_training(&mut self, runner: ExternalRunner) -> Result<(), ManagerError> {
        if self.is_pow_running() {
            return Err(ManagerError::ResourceConflict { tenant: "pow" });
        }
        if let Some(tenant) = self.running_tenant() {
            return Err(ManagerError::ResourceConflict { tenant });
        }
        let mut runner = runner;
        let tenant = runner.name();
        runner
            .start()
            .map_err(|source| ManagerError::Runner { tenant, source })?;
        self.training = Some(runner);
        Ok(())
    }

    pub async fn stop_training(&mut self) -> Result<(), ManagerError> {
        let mut runner = self.training.take().ok_or(ManagerError::NotInitialized)?;
        runner.stop().await;
        Ok(())
    }

    /// Process-exit teardown: releases every tenant.
    pub async fn shutdown(&mut self) {
        if self.pow.is_some() {
            if let Err(err) = self.stop_pow().await {
                warn!(%err, "pow teardown failed during shutdown");
            }
        }
        if let Some(runner) = self.inference.as_mut() {
            runner.stop().await;
        }
        if let Some(runner) = self.training.as_mut() {
            runner.stop().await;
        }
    }
}

fn engine_response(engine: &PowEngine, state: PowState) -> PowStatusResponse {
    let initialized = engine.controller.is_model_initialized();
    let mut response = PowStatusResponse::of(state);
    if !initialized {
        response.is_model_initialized = Some(false);
        response.details = Some("Model is still loading".to_string());
    }
    response
}
