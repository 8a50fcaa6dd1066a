//! # Repositories
//!
//! Database access layer. Each repository encapsulates the SeaORM queries
//! for one table; durability-critical transitions (job start, batch claim,
//! idempotent enqueue) live here so the orchestrator and handlers share one
//! implementation.

pub mod checkpoint;
pub mod dead_letter;
pub mod license;
pub mod queue;
pub mod sync_job;

pub use checkpoint::CheckpointRepository;
pub use dead_letter::DeadLetterRepository;
pub use license::LicenseRepository;
pub use queue::QueueRepository;
pub use sync_job::SyncJobRepository;
