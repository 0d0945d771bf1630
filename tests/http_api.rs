//! Full-stack scenarios: HTTP control plane, worker subprocesses, egress to
//! a stub sink, and fraud verdicts on peer submissions.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use url::Url;

use pow_node::batch::{ProofBatch, ValidatedBatch};
use pow_node::client::PowClient;
use pow_node::compute::Compute;
use pow_node::config::Device;
use pow_node::handlers;
use pow_node::manager::{Manager, PowInitRequest};
use pow_node::phase::PowState;

const SINK_DEADLINE: Duration = Duration::from_secs(90);

/// Captures everything the node ships out, the way the network sink would.
#[derive(Clone, Default)]
struct SinkState {
    generated: Arc<Mutex<Vec<ProofBatch>>>,
    validated: Arc<Mutex<Vec<ValidatedBatch>>>,
}

async fn sink_generated(State(state): State<SinkState>, Json(batch): Json<ProofBatch>) -> StatusCode {
    state.generated.lock().unwrap().push(batch);
    StatusCode::OK
}

async fn sink_validated(
    State(state): State<SinkState>,
    Json(batch): Json<ValidatedBatch>,
) -> StatusCode {
    state.validated.lock().unwrap().push(batch);
    StatusCode::OK
}

async fn start_sink() -> (Url, SinkState) {
    let state = SinkState::default();
    let app = Router::new()
        .route("/generated", post(sink_generated))
        .route("/validated", post(sink_validated))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}").parse().unwrap(), state)
}

async fn start_node() -> Url {
    let manager = Manager::new(common::config(vec![Device::Cpu]))
        .with_launcher(common::launcher())
        .into_shared();
    let app = Router::new()
        .nest("/api/v1", handlers::routes())
        .with_state(manager);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}").parse().unwrap()
}

fn init_request(sink: Url, batch_size: usize) -> PowInitRequest {
    PowInitRequest {
        url: sink,
        block_hash: "0x00".into(),
        block_height: 0,
        public_key: "0x00".into(),
        batch_size,
        r_target: common::R_TARGET,
        fraud_threshold: 1e-2,
        params: common::tiny_params(),
    }
}

/// Splits the nonce space with a session-identical local compute: one known
/// proof and ten nonces whose true distance misses the target.
fn pick_nonces(request: &PowInitRequest) -> (u64, f32, Vec<u64>) {
    let compute = Compute::new(pow_node::session::Session {
        block_hash: request.block_hash.clone(),
        block_height: request.block_height,
        public_key: request.public_key.clone(),
        batch_size: request.batch_size,
        r_target: request.r_target,
        fraud_threshold: request.fraud_threshold,
        params: request.params.clone(),
    })
    .expect("local compute");

    let mut proof = None;
    let mut misses = Vec::new();
    for nonce in 0..10_000u64 {
        let batch = compute.generate(&[nonce]).expect("distance");
        let dist = batch.dist[0];
        if (dist as f64) < request.r_target {
            if proof.is_none() {
                proof = Some((nonce, dist));
            }
        } else if misses.len() < 10 {
            misses.push(nonce);
        }
        if proof.is_some() && misses.len() == 10 {
            break;
        }
    }
    let (nonce, dist) = proof.expect("at least one proof nonce");
    assert_eq!(misses.len(), 10, "not enough non-proof nonces");
    (nonce, dist, misses)
}

#[tokio::test]
async fn generation_validation_and_fraud_verdicts() {
    let (sink_url, sink) = start_sink().await;
    let node_url = start_node().await;
    let client = PowClient::new(node_url);
    let request = init_request(sink_url, 50);

    client.init_generate(&request).await.expect("init generate");

    // Proofs flow to the sink without any further prompting.
    common::wait_for(SINK_DEADLINE, || {
        (!sink.generated.lock().unwrap().is_empty()).then_some(())
    })
    .await
    .expect("generated batches reach the sink");
    {
        let generated = sink.generated.lock().unwrap();
        assert!(generated.iter().all(|b| b.public_key == "0x00"));
        assert!(
            generated
                .iter()
                .flat_map(|b| &b.dist)
                .all(|&d| (d as f64) < common::R_TARGET)
        );
    }

    client.start_validation().await.expect("switch to validate");

    let (proof_nonce, proof_dist, miss_nonces) = pick_nonces(&request);

    // An honest submission: every entry is a real proof.
    let honest = ProofBatch {
        public_key: request.public_key.clone(),
        block_hash: request.block_hash.clone(),
        block_height: request.block_height,
        nonces: vec![proof_nonce; 2000],
        dist: vec![proof_dist; 2000],
    };
    client.validate(&honest).await.expect("submit honest batch");
    common::wait_for(SINK_DEADLINE, || {
        (!sink.validated.lock().unwrap().is_empty()).then_some(())
    })
    .await
    .expect("honest verdict reaches the sink");
    {
        let validated = sink.validated.lock().unwrap();
        let verdict = validated.last().unwrap();
        assert_eq!(verdict.n_invalid, 0);
        assert!(!verdict.fraud_detected);
        assert!(verdict.probability_honest > 0.99);
    }

    // A dishonest submission: ten entries claim proof distances for nonces
    // whose true distance misses the target.
    let mut nonces = vec![proof_nonce; 1990];
    nonces.extend(&miss_nonces);
    let dishonest = ProofBatch {
        public_key: request.public_key.clone(),
        block_hash: request.block_hash.clone(),
        block_height: request.block_height,
        nonces,
        dist: vec![proof_dist; 2000],
    };
    client
        .validate(&dishonest)
        .await
        .expect("submit dishonest batch");
    common::wait_for(SINK_DEADLINE, || {
        (sink.validated.lock().unwrap().len() >= 2).then_some(())
    })
    .await
    .expect("dishonest verdict reaches the sink");
    {
        let validated = sink.validated.lock().unwrap();
        let verdict = validated.last().unwrap();
        assert_eq!(verdict.n_invalid, 10);
        assert!(verdict.fraud_detected);
        assert!(verdict.probability_honest < 1e-2);
        assert_eq!(verdict.fraud_threshold, 1e-2);
    }

    let status = client.status().await.expect("status");
    assert_eq!(status.status, PowState::Validating);

    let stopped = client.stop().await.expect("stop");
    assert_eq!(stopped.status, PowState::Stopped);
    let status = client.status().await.expect("status after stop");
    assert_eq!(status.status, PowState::NoController);
}

#[tokio::test]
async fn init_is_rejected_while_initialized() {
    let (sink_url, _sink) = start_sink().await;
    let node_url = start_node().await;
    let client = PowClient::new(node_url);
    let request = init_request(sink_url, 20);

    client.init(&request).await.expect("first init");
    let err = client.init(&request).await.expect_err("second init");
    match err {
        pow_node::client::ClientError::Api { status, .. } => {
            assert_eq!(status, StatusCode::BAD_REQUEST)
        }
        other => panic!("unexpected error: {other}"),
    }
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn stop_under_load_returns_promptly_over_http() {
    // A sink that refuses connections: egress backs off and queues grow,
    // which must not slow the teardown.
    let dead_sink: Url = "http://127.0.0.1:9/".parse().unwrap();
    let node_url = start_node().await;
    let client = PowClient::new(node_url);
    let request = init_request(dead_sink, 20);

    client.init_generate(&request).await.expect("init generate");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let begin = std::time::Instant::now();
    let stopped = client.stop().await.expect("stop");
    assert_eq!(stopped.status, PowState::Stopped);
    assert!(begin.elapsed() <= Duration::from_secs(35));

    let status = client.status().await.expect("status");
    assert_eq!(status.status, PowState::NoController);
}
