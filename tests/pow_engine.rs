//! Engine-level scenarios against real worker subprocesses.

mod common;

use std::time::{Duration, Instant};

use pow_node::batch::ProofBatch;
use pow_node::config::Device;
use pow_node::controller::ParallelController;
use pow_node::phase::Phase;
use pow_node::session::NodeTopology;

const INIT_DEADLINE: Duration = Duration::from_secs(60);
const BATCH_DEADLINE: Duration = Duration::from_secs(60);

async fn started_controller(
    params: pow_node::params::Params,
    batch_size: usize,
) -> ParallelController {
    let mut controller = ParallelController::new(
        common::session(params, batch_size),
        NodeTopology::default(),
        vec![Device::Cpu],
        common::launcher(),
    )
    .expect("valid session");
    controller.start().await.expect("workers spawn");
    common::wait_for(INIT_DEADLINE, || {
        controller.is_model_initialized().then_some(())
    })
    .await
    .expect("model init within deadline");
    controller
}

#[tokio::test]
async fn generate_then_validate_round_trip() {
    let mut controller = started_controller(common::small_params(), 100).await;

    controller.start_generate().await;
    let batch = common::wait_for(BATCH_DEADLINE, || {
        controller.get_generated().into_iter().next()
    })
    .await
    .expect("a generated batch");
    controller.stop_generate().await;

    assert!(!batch.is_empty());
    assert_eq!(batch.public_key, "0x00");
    assert!(batch.dist.iter().all(|&d| (d as f64) < common::R_TARGET));

    controller.start_validate().await;
    controller
        .to_validate(batch.clone())
        .await
        .expect("ingress accepted");

    let mut chunks: Vec<ProofBatch> = Vec::new();
    common::wait_for(BATCH_DEADLINE, || {
        chunks.extend(controller.get_validated());
        let total: usize = chunks.iter().map(ProofBatch::len).sum();
        (total >= batch.len()).then_some(())
    })
    .await
    .expect("validated chunks within deadline");

    let recomputed = ProofBatch::merge(&chunks).expect("tag-equal chunks");
    let recomputed = recomputed.sort_by_nonce();
    let original = batch.sort_by_nonce();
    assert_eq!(recomputed.nonces, original.nonces);
    for (&received, &computed) in original.dist.iter().zip(&recomputed.dist) {
        assert!(
            (received - computed).abs() < 1e-3,
            "distance drifted: {received} vs {computed}"
        );
    }

    controller.stop().await;
    assert!(!controller.is_running());
}

#[tokio::test]
async fn repeated_start_generate_is_idempotent() {
    let mut controller = started_controller(common::tiny_params(), 20).await;

    controller.start_generate().await;
    assert_eq!(controller.phase(), Phase::Generate);
    controller.start_generate().await;
    assert_eq!(controller.phase(), Phase::Generate);
    assert!(controller.is_running());

    // The queue keeps growing monotonically: successive drains both yield
    // batches, with no duplicate workers producing overlapping nonces.
    let first = common::wait_for(BATCH_DEADLINE, || {
        let drained = controller.get_generated();
        (!drained.is_empty()).then_some(drained)
    })
    .await
    .expect("first drain");
    let second = common::wait_for(BATCH_DEADLINE, || {
        let drained = controller.get_generated();
        (!drained.is_empty()).then_some(drained)
    })
    .await
    .expect("second drain");

    let mut seen = std::collections::HashSet::new();
    for batch in first.iter().chain(&second) {
        for &nonce in &batch.nonces {
            assert!(seen.insert(nonce), "nonce {nonce} generated twice");
        }
    }

    controller.stop().await;
}

#[tokio::test]
async fn stop_under_generation_load_is_prompt() {
    let mut controller = started_controller(common::tiny_params(), 20).await;

    controller.start_generate().await;
    // Let the queues fill.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let begin = Instant::now();
    controller.stop().await;
    let elapsed = begin.elapsed();

    assert!(
        elapsed <= Duration::from_secs(35),
        "stop took {elapsed:?}"
    );
    assert!(!controller.is_running());
}

#[tokio::test]
async fn stop_with_multiple_workers_is_bounded_by_the_slowest() {
    let mut controller = ParallelController::new(
        common::session(common::tiny_params(), 20),
        NodeTopology::default(),
        vec![Device::Cpu, Device::Cpu, Device::Cpu],
        common::launcher(),
    )
    .expect("valid session");
    controller.start().await.expect("workers spawn");
    common::wait_for(INIT_DEADLINE, || {
        controller.is_model_initialized().then_some(())
    })
    .await
    .expect("model init within deadline");

    controller.start_generate().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Worker joins run concurrently, so the bound holds per worker rather
    // than per device count.
    let begin = Instant::now();
    controller.stop().await;
    let elapsed = begin.elapsed();

    assert!(
        elapsed <= Duration::from_secs(35),
        "stop of three workers took {elapsed:?}"
    );
    assert!(!controller.is_running());
}

#[tokio::test]
async fn validation_errors_do_not_kill_the_worker() {
    let mut controller = started_controller(common::tiny_params(), 20).await;
    controller.start_validate().await;

    // A batch whose nonces were never proofs: recomputation succeeds and
    // reports the real distances; the worker stays healthy either way.
    let batch = ProofBatch {
        public_key: "peer".into(),
        block_hash: "0x00".into(),
        block_height: 0,
        nonces: vec![1, 2, 3],
        dist: vec![0.1, 0.1, 0.1],
    };
    controller.to_validate(batch).await.expect("ingress");

    common::wait_for(BATCH_DEADLINE, || {
        controller.get_validated().into_iter().next()
    })
    .await
    .expect("validated chunk");
    assert!(controller.is_running());

    controller.stop().await;
}
