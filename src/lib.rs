//! Key Manager Worker
//!
//! In-node coordinator for a hosted trusted-execution-environment key
//! manager enclave. The worker:
//! - drives the enclave through status-based initialization with attested,
//!   verified responses,
//! - participates in the committee that publishes one ephemeral secret per
//!   epoch, deduplicating against consensus and replicating observed
//!   secrets into the enclave,
//! - keeps a per-runtime peer access-control list in step with scheduler
//!   committees,
//! - exposes the `call_enclave` entry point the p2p layer routes enclave
//!   RPCs through.
//!
//! Consensus, registry, scheduler, beacon and runtime-host collaborators
//! are narrow traits (see [`backend`] and [`host`]); [`local`] provides
//! in-process insecure implementations for development and tests.

pub mod access;
pub mod api;
pub mod attestation;
pub mod backend;
pub mod cbor;
pub mod config;
pub mod enclave_rpc;
pub mod error;
pub mod host;
pub mod local;
pub mod secrets;
pub mod watcher;
pub mod worker;
