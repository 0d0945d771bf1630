//! Compute-node HTTP entrypoint.
//!
//! This binary launches the Axum-based control plane for the node's
//! proof-of-work engine.
//!
//! Endpoints (prefix `/api/v1`):
//! - `POST /pow/init` – construct a session; workers start; phase=IDLE
//! - `POST /pow/init/generate` / `POST /pow/init/validate` – idempotent init + phase
//! - `POST /pow/phase/generate` / `POST /pow/phase/validate` – phase transitions
//! - `POST /pow/validate` – enqueue a peer batch for validation
//! - `GET  /pow/status` – engine state
//! - `POST /pow/stop` – session teardown
//!
//! The same executable doubles as the worker process: the hidden `worker`
//! subcommand reads its session spec from stdin and speaks the line
//! protocol on stdout. The controller spawns one such child per device.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the bind address
//! - `POW_NODE_ID`, `POW_NODE_COUNT`, `POW_DEVICES` set the nonce partition
//! - `MODEL_PARAMS_PATH` points at the default model hyperparameters

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::process::ExitCode;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use pow_node::config::{Config, ServeArgs};
use pow_node::manager::Manager;
use pow_node::{handlers, shutdown, telemetry, worker};

#[derive(Parser, Debug)]
#[command(name = "pow-node")]
#[command(about = "Proof-of-work compute node")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP control plane (the default).
    Serve(ServeArgs),
    /// Internal: per-device worker process, driven over stdin/stdout.
    #[command(hide = true)]
    Worker,
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Worker) => {
            telemetry::init_worker();
            match worker::run_stdio() {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!(%err, "worker failed");
                    ExitCode::FAILURE
                }
            }
        }
        Some(Command::Serve(args)) => serve(args),
        None => serve(cli.serve),
    }
}

fn serve(args: ServeArgs) -> ExitCode {
    telemetry::init();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run_server(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&args)?;
    let addr = SocketAddr::new(config.host, config.port);
    let manager = Manager::new(config).into_shared();

    let app = axum::Router::new()
        .nest("/api/v1", handlers::routes())
        .with_state(manager.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers(cors::Any),
        );

    tracing::info!("starting server at http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::wait(manager))
        .await?;
    Ok(())
}
