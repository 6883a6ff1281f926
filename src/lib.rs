//! Library root for the `cynapse` crate
//!
//! Cynapse keeps a secret split across removable media, reassembles it only
//! when a quorum of intact fragments is present, and launches signed tools
//! under confinement. Every security-relevant step lands in an append-only,
//! hash-chained audit log.

// Core error handling
pub mod errors;

// Configuration
pub mod config;

// Fragments & reconstruction
pub mod fragment_store;
pub mod reconstructor;
pub mod secret_session;
pub mod shamir;

// Tool authenticity & discovery
pub mod keys;
pub mod registry;
pub mod signature;

// Execution
pub mod engine;
pub mod sandbox;

// Audit
pub mod audit_log;
pub mod audit_verifier;

// Runtime & front end
pub mod activation;
pub mod cli;
pub mod runtime;

pub use errors::{CynapseError, CynapseResult};
pub use runtime::Cynapse;
