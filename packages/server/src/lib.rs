// Skysweep - Cloud Cost Governance API Core
//
// This crate provides the durable background-job subsystem that drives all
// heavy work in the platform: per-tenant cost ingestion, multi-cloud zombie
// scans, remediation sweeps, recurring billing, webhook retries and
// notifications. Jobs live in PostgreSQL and are claimed with
// FOR UPDATE SKIP LOCKED so any number of replicas can process them safely.

pub mod common;
pub mod config;
pub mod db;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::Config;
