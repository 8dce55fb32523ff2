//! Telemetry gateway: authenticated HTTP ingestion of device samples into
//! SQLite, with nonce-based replay protection.

pub mod clock;
pub mod config;
pub mod db;
pub mod envelope;
pub mod errors;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod rest;
pub mod store;
pub mod validate;

pub use pipeline::{Ingestor, Rejection};
