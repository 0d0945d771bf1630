//! Compute-node service for a decentralized inference network.
//!
//! The core of the node is its proof-of-work engine: a fixed transformer
//! forward pass, with weights derived deterministically from the block
//! hash, is evaluated over disjoint slices of the nonce space to produce
//! candidate proofs, and re-evaluated to validate proofs submitted by
//! peers. Submitter behavior is scored against a binomial fraud model and
//! everything is shipped to an HTTP sink.
//!
//! # Architecture
//!
//! One control process runs the HTTP surface ([`handlers`]), the tenancy
//! manager ([`manager`]) and the egress task ([`sender`]). Each device gets
//! a dedicated worker *process* ([`worker`]) spawned from this same binary,
//! so a device's context dies with its process and STOP is always
//! reclaimable. The controller ([`controller`]) owns the phase (single
//! writer) and the queues crossing the process boundary.
//!
//! # Modules
//!
//! - [`params`] — model hyperparameters, fixed per session.
//! - [`model`] — the deterministic transformer and its weight derivation.
//! - [`compute`] — nonce → distance evaluation and the published metric.
//! - [`nonce`] — disjoint nonce enumeration across (node, device).
//! - [`batch`] — proof batches, validation records, batch algebra.
//! - [`fraud`] — the binomial honesty test.
//! - [`phase`] — the shared phase and reported engine states.
//! - [`controller`] / [`worker`] / [`ipc`] — process topology and transport.
//! - [`sender`] — sink egress with backoff and the in-validation registry.
//! - [`manager`] / [`handlers`] — GPU tenancy and the HTTP control plane.
//! - [`client`] — typed client for the control plane.

pub mod batch;
pub mod client;
pub mod compute;
pub mod config;
pub mod controller;
pub mod fraud;
pub mod handlers;
pub mod ipc;
pub mod manager;
pub mod model;
pub mod nonce;
pub mod params;
pub mod phase;
pub mod runner;
pub mod sender;
pub mod session;
pub mod shutdown;
pub mod telemetry;
pub mod worker;
