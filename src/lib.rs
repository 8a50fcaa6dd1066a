//! # Regsync Library
//!
//! This library provides the core functionality for the regsync service: a
//! durable synchronization engine between local cultivation inventory and an
//! external regulatory registry, plus its admin API.

pub mod audit;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod local;
pub mod models;
pub mod orchestrator;
pub mod reconciliation;
pub mod registry;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub use migration;
