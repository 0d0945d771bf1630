//! Shared fixtures for the integration tests.
//!
//! These tests drive real worker subprocesses: the launcher points at the
//! compiled `pow-node` binary that cargo builds alongside the test crates.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use pow_node::config::{Config, Device};
use pow_node::controller::WorkerLauncher;
use pow_node::params::Params;
use pow_node::session::Session;

/// Distance target calibrated so a useful fraction of nonces are proofs.
pub const R_TARGET: f64 = 1.39635417620795;

pub fn launcher() -> WorkerLauncher {
    WorkerLauncher::with_program(PathBuf::from(env!("CARGO_BIN_EXE_pow-node")))
}

/// The round-trip configuration: dim 128, vocab 128, shallow stack.
pub fn small_params() -> Params {
    Params {
        dim: 128,
        n_layers: 2,
        n_heads: 4,
        n_kv_heads: 4,
        vocab_size: 128,
        ffn_dim_multiplier: 1.0,
        multiple_of: 32,
        norm_eps: 1e-5,
        rope_theta: 10_000.0,
        use_scaled_rope: false,
        seq_len: 4,
    }
}

/// An even smaller configuration for the heavier end-to-end scenarios.
pub fn tiny_params() -> Params {
    Params {
        dim: 64,
        n_layers: 1,
        n_heads: 4,
        n_kv_heads: 2,
        vocab_size: 64,
        ffn_dim_multiplier: 1.0,
        multiple_of: 32,
        norm_eps: 1e-5,
        rope_theta: 10_000.0,
        use_scaled_rope: false,
        seq_len: 4,
    }
}

pub fn session(params: Params, batch_size: usize) -> Session {
    Session {
        block_hash: "0x00".into(),
        block_height: 0,
        public_key: "0x00".into(),
        batch_size,
        r_target: R_TARGET,
        fraud_threshold: 0.01,
        params,
    }
}

pub fn config(devices: Vec<Device>) -> Config {
    Config {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        node_id: 0,
        node_count: 1,
        devices,
        default_params: Params::default(),
    }
}

/// Polls `probe` every 100 ms until it yields a value or the deadline hits.
pub async fn wait_for<T, F>(deadline: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let start = tokio::time::Instant::now();
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if start.elapsed() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
