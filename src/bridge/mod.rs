//! Contract with the machine bridge, the external process that drives the
//! physical CNC controllers.
//!
//! Outbound calls go through [`BridgeClient`], which bounds every call with a
//! timeout and normalizes raw status codes. Inbound completions arrive as
//! [`CompletionEvent`]s on an mpsc channel, fed either by the HTTP callback
//! endpoints or directly by an in-process bridge such as [`SimulatedBridge`].

pub mod callback;
pub mod client;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use callback::{CallbackEvent, MachiningCallback, MachiningLog, MachiningRecord, RecordStatus};
pub use client::BridgeClient;
pub use simulated::SimulatedBridge;

/// Opaque handle the bridge returns for an uploaded program. It round-trips
/// through every callback so a completion can be attributed to exactly one
/// dispatched unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRef(pub String);

impl JobRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "outcome", content = "reason")]
pub enum CompletionOutcome {
    Success,
    Fail(String),
}

/// Hardware reported that the program behind `job_ref` finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub machine_id: String,
    pub job_ref: JobRef,
    pub outcome: CompletionOutcome,
}

impl CompletionEvent {
    pub fn success(machine_id: impl Into<String>, job_ref: JobRef) -> Self {
        Self {
            machine_id: machine_id.into(),
            job_ref,
            outcome: CompletionOutcome::Success,
        }
    }

    pub fn fail(machine_id: impl Into<String>, job_ref: JobRef, reason: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            job_ref,
            outcome: CompletionOutcome::Fail(reason.into()),
        }
    }
}

/// Device-facing operations. Implementations report raw status strings;
/// interpretation happens in [`BridgeClient::poll_status`].
///
/// A call that the bridge refuses should return `ConductorError::BridgeRejected`.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn upload(&self, machine_id: &str, program: &str) -> Result<JobRef>;

    async fn start(&self, machine_id: &str, job_ref: &JobRef) -> Result<()>;

    async fn stop(&self, machine_id: &str) -> Result<()>;

    async fn reset(&self, machine_id: &str) -> Result<()>;

    async fn poll_status(&self, machine_id: &str) -> Result<String>;
}
