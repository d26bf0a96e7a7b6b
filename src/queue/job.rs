use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::JobRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// One part per program load
    Single,
    /// Repeats the same program back to back for every unit
    Continuous,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Single => write!(f, "single"),
            JobKind::Continuous => write!(f, "continuous"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: Uuid,
    pub machine_id: String,
    pub request_id: String,
    pub kind: JobKind,
    pub quantity: u32,
    /// Dense 1-based position among the machine's waiting jobs
    pub order: u32,
    pub paused: bool,
    /// Set by the queue when the job is accepted
    pub created_at: DateTime<Utc>,
    /// NC program reference handed to the bridge on upload
    pub program: String,
}

impl QueueJob {
    pub fn new(
        machine_id: impl Into<String>,
        request_id: impl Into<String>,
        program: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            machine_id: machine_id.into(),
            request_id: request_id.into(),
            kind: JobKind::Single,
            quantity: 1,
            order: 0,
            paused: false,
            created_at: DateTime::<Utc>::default(),
            program: program.into(),
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self.kind = if quantity > 1 {
            JobKind::Continuous
        } else {
            JobKind::Single
        };
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightState {
    /// Popped from the queue, upload/start not yet confirmed
    Starting,
    /// Start confirmed, waiting for the completion callback
    Running,
    /// A bridge call timed out; the next status poll decides
    Uncertain,
}

/// The single unit a machine is working on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlight {
    /// Copy of the source job with `quantity == 1`
    pub job: QueueJob,
    pub job_ref: Option<JobRef>,
    pub state: InFlightState,
    pub dispatched_at: DateTime<Utc>,
    /// Owning request was cancelled while this unit was on hardware
    #[serde(default)]
    pub cancel_requested: bool,
}

/// A unit that hardware or the bridge refused, kept for operator retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub job: QueueJob,
    pub job_ref: Option<JobRef>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}
