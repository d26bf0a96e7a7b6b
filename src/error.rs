use thiserror::Error;
use uuid::Uuid;

use crate::machine::MachineStatus;
use crate::queue::QueueJob;
use crate::stage::ManufacturingRequest;

/// Errors raised by the storage backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Lock {name} is held by {holder:?}")]
    LockContention {
        name: String,
        holder: Option<String>,
    },

    #[error("Leadership of {name} lost: {reason}")]
    LeadershipLost { name: String, reason: String },

    #[error("Bridge call {operation} timed out for machine {machine_id}")]
    BridgeTimeout {
        machine_id: String,
        operation: &'static str,
    },

    #[error("Bridge rejected job on machine {machine_id}: {reason}")]
    BridgeRejected { machine_id: String, reason: String },

    #[error("Invalid transition for request {request_id}: {reason}")]
    InvalidTransition {
        request_id: String,
        reason: String,
        current: Box<ManufacturingRequest>,
    },

    #[error("Stale queue update for machine {machine_id}: {reason}")]
    StaleBatchApply {
        machine_id: String,
        reason: String,
        current: Vec<QueueJob>,
    },

    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("Queue job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Machine {machine_id} cannot accept jobs while {status}")]
    MachineUnavailable {
        machine_id: String,
        status: MachineStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Quantity must be at least 1, got {0}")]
    InvalidQuantity(u32),

    #[error("Queue for machine {machine_id} is at capacity ({capacity})")]
    QueueFull { machine_id: String, capacity: usize },

    #[error("Conditional write on {key} lost (expected revision {expected})")]
    StoreConflict { key: String, expected: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    /// Errors that must terminate the process rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConductorError::LeadershipLost { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
