use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::{CompletionEvent, CompletionOutcome, JobRef};
use crate::clock::Clock;
use crate::error::{ConductorError, Result};
use crate::store::{Collection, StateStore};

/// Callback kinds the bridge posts to `/api/bridge/machining/{event}/{machineId}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackEvent {
    Start,
    Tick,
    Complete,
    Fail,
}

impl FromStr for CallbackEvent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "start" => Ok(CallbackEvent::Start),
            "tick" => Ok(CallbackEvent::Tick),
            "complete" => Ok(CallbackEvent::Complete),
            "fail" => Ok(CallbackEvent::Fail),
            other => Err(format!("unknown machining event: {}", other)),
        }
    }
}

impl std::fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackEvent::Start => write!(f, "start"),
            CallbackEvent::Tick => write!(f, "tick"),
            CallbackEvent::Complete => write!(f, "complete"),
            CallbackEvent::Fail => write!(f, "fail"),
        }
    }
}

/// Body of a bridge callback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachiningCallback {
    pub job_ref: JobRef,
    #[serde(default)]
    pub elapsed_seconds: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub alarms: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Running)
    }
}

/// Operator-facing history of one dispatched unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachiningRecord {
    pub machine_id: String,
    pub job_ref: JobRef,
    pub request_id: Option<String>,
    pub status: RecordStatus,
    pub started_at: DateTime<Utc>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub completed_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub alarms: Vec<String>,
}

impl MachiningRecord {
    fn new(machine_id: &str, job_ref: &JobRef, request_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            job_ref: job_ref.clone(),
            request_id,
            status: RecordStatus::Running,
            started_at: now,
            last_tick_at: None,
            elapsed_seconds: 0,
            completed_at: None,
            reason: None,
            alarms: Vec::new(),
        }
    }
}

/// Machining records keyed by job reference.
///
/// Terminal records are never reopened, so a duplicated `complete` or `fail`
/// callback produces no second completion event.
pub struct MachiningLog {
    records: Collection<MachiningRecord>,
    clock: Arc<dyn Clock>,
}

impl MachiningLog {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Collection::new(store, "machining/"),
            clock,
        }
    }

    pub async fn load(&self) -> Result<usize> {
        self.records.load_all().await
    }

    pub async fn get(&self, job_ref: &JobRef) -> Option<MachiningRecord> {
        self.records.get(job_ref.as_str()).await
    }

    pub async fn for_machine(&self, machine_id: &str) -> Vec<MachiningRecord> {
        let mut records: Vec<MachiningRecord> = self
            .records
            .values()
            .await
            .into_iter()
            .filter(|r| r.machine_id == machine_id)
            .collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    /// Record that a unit was started on hardware.
    pub async fn open(
        &self,
        machine_id: &str,
        job_ref: &JobRef,
        request_id: Option<String>,
    ) -> Result<()> {
        let now = self.clock.now();
        self.records
            .ensure(job_ref.as_str(), || {
                MachiningRecord::new(machine_id, job_ref, request_id.clone(), now)
            })
            .await?;
        if let Some(request_id) = request_id {
            self.records
                .update(job_ref.as_str(), |r| {
                    r.request_id.get_or_insert(request_id);
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// Move a record to a terminal status. Returns `false` if it already was terminal.
    pub async fn finish(
        &self,
        machine_id: &str,
        job_ref: &JobRef,
        status: RecordStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now();
        self.records
            .ensure(job_ref.as_str(), || MachiningRecord::new(machine_id, job_ref, None, now))
            .await?;
        let changed = self
            .records
            .update(job_ref.as_str(), |r| {
                if r.status.is_terminal() {
                    return Ok(false);
                }
                r.status = status;
                r.completed_at = Some(now);
                r.elapsed_seconds = (now - r.started_at).num_seconds().max(0) as u64;
                if reason.is_some() {
                    r.reason = reason;
                }
                Ok(true)
            })
            .await?;
        Ok(changed.unwrap_or(false))
    }

    /// Apply an inbound bridge callback. Returns the updated record and, for
    /// the first `complete` or `fail` of a unit, the completion to hand to the
    /// dispatch loop.
    pub async fn apply(
        &self,
        machine_id: &str,
        event: CallbackEvent,
        payload: MachiningCallback,
    ) -> Result<(MachiningRecord, Option<CompletionEvent>)> {
        let now = self.clock.now();
        let job_ref = payload.job_ref.clone();
        self.records
            .ensure(job_ref.as_str(), || MachiningRecord::new(machine_id, &job_ref, None, now))
            .await?;

        let outcome = self
            .records
            .update(job_ref.as_str(), |r| {
                if r.machine_id != machine_id {
                    return Err(ConductorError::BridgeRejected {
                        machine_id: machine_id.to_string(),
                        reason: format!("job {} belongs to machine {}", r.job_ref, r.machine_id),
                    });
                }
                if r.status.is_terminal() {
                    return Ok((r.clone(), None));
                }
                if let Some(elapsed) = payload.elapsed_seconds {
                    r.elapsed_seconds = elapsed;
                }
                r.alarms.extend(payload.alarms.iter().cloned());

                let completion = match event {
                    CallbackEvent::Start => {
                        r.started_at = now;
                        None
                    }
                    CallbackEvent::Tick => {
                        r.last_tick_at = Some(now);
                        None
                    }
                    CallbackEvent::Complete => {
                        r.status = RecordStatus::Completed;
                        r.completed_at = Some(now);
                        Some(CompletionOutcome::Success)
                    }
                    CallbackEvent::Fail => {
                        let reason = payload
                            .reason
                            .clone()
                            .unwrap_or_else(|| "machining failed".to_string());
                        r.status = RecordStatus::Failed;
                        r.completed_at = Some(now);
                        r.reason = Some(reason.clone());
                        Some(CompletionOutcome::Fail(reason))
                    }
                };
                let completion = completion.map(|outcome| CompletionEvent {
                    machine_id: machine_id.to_string(),
                    job_ref: r.job_ref.clone(),
                    outcome,
                });
                Ok((r.clone(), completion))
            })
            .await?
            .ok_or_else(|| ConductorError::Internal(format!("machining record {} vanished", job_ref)))?;

        tracing::debug!(machine_id, job_ref = %job_ref, event = %event, "Bridge callback applied");
        Ok(outcome)
    }
}
