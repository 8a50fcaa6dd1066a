//! # Data Models
//!
//! SeaORM entities for the compliance sync engine plus the shared domain
//! vocabulary (entity types, directions, operations, status strings).

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod audit_event;
pub mod license;
pub mod queue_item;
pub mod sync_checkpoint;
pub mod sync_job;

pub use audit_event::Entity as AuditEvent;
pub use license::Entity as License;
pub use queue_item::Entity as QueueItem;
pub use sync_checkpoint::Entity as SyncCheckpoint;
pub use sync_job::Entity as SyncJob;

/// Entity types tracked against the external registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Plant,
    Harvest,
    Package,
    Transfer,
    LabResult,
}

impl EntityType {
    /// All entity types, in causal-dependency order (a package exists before
    /// a transfer referencing it).
    pub const ALL: [EntityType; 5] = [
        EntityType::Plant,
        EntityType::Harvest,
        EntityType::Package,
        EntityType::Transfer,
        EntityType::LabResult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Plant => "plant",
            EntityType::Harvest => "harvest",
            EntityType::Package => "package",
            EntityType::Transfer => "transfer",
            EntityType::LabResult => "lab_result",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plant" => Some(EntityType::Plant),
            "harvest" => Some(EntityType::Harvest),
            "package" => Some(EntityType::Package),
            "transfer" => Some(EntityType::Transfer),
            "lab_result" => Some(EntityType::LabResult),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a sync operation relative to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local state is written to the registry.
    Push,
    /// Registry state is fetched and applied locally.
    Pull,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "push" => Some(Direction::Push),
            "pull" => Some(Direction::Pull),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction requested for a whole sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobDirection {
    Push,
    Pull,
    Both,
}

impl JobDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobDirection::Push => "push",
            JobDirection::Pull => "pull",
            JobDirection::Both => "both",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "push" => Some(JobDirection::Push),
            "pull" => Some(JobDirection::Pull),
            "both" => Some(JobDirection::Both),
            _ => None,
        }
    }

    pub fn includes(&self, direction: Direction) -> bool {
        match self {
            JobDirection::Push => direction == Direction::Push,
            JobDirection::Pull => direction == Direction::Pull,
            JobDirection::Both => true,
        }
    }
}

/// Operation carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status strings for sync jobs.
pub mod job_status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
}

/// Status strings for queue items.
pub mod item_status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const SUCCEEDED: &str = "succeeded";
    /// Failed with retries remaining; rescheduled with backoff.
    pub const FAILED: &str = "failed";
    /// Dead-letter state; exits only via manual retry or dismissal.
    pub const FAILED_PERMANENT: &str = "failed_permanent";
    pub const DISMISSED: &str = "dismissed";

    /// Statuses counted against the live idempotency-key uniqueness guard.
    pub const LIVE: [&str; 3] = [PENDING, PROCESSING, FAILED];
}

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "regsync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
