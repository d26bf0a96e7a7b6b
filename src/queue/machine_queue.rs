use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::JobRef;
use crate::error::{ConductorError, Result};
use crate::queue::job::{FailedJob, InFlight, InFlightState, QueueJob};

/// Failed-shelf entries kept per machine. Beyond this the oldest entry is dropped.
pub const FAILED_SHELF_LIMIT: usize = 100;

/// Persistent queue document of one machine.
///
/// `jobs` holds the waiting jobs sorted by `order`, which is kept dense
/// (`1..=n`) after every mutation. The unit on hardware lives in `in_flight`
/// and is not part of the ordered list. A job id appears at most once in
/// `jobs` and at most once on the `failed` shelf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineQueue {
    pub machine_id: String,
    pub jobs: Vec<QueueJob>,
    pub in_flight: Option<InFlight>,
    #[serde(default)]
    pub failed: Vec<FailedJob>,
}

impl MachineQueue {
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            jobs: Vec::new(),
            in_flight: None,
            failed: Vec::new(),
        }
    }

    /// Waiting jobs plus the in-flight unit.
    pub fn depth(&self) -> usize {
        self.jobs.len() + usize::from(self.in_flight.is_some())
    }

    pub fn contains_request(&self, request_id: &str) -> bool {
        self.jobs.iter().any(|j| j.request_id == request_id)
            || self
                .in_flight
                .as_ref()
                .is_some_and(|f| f.job.request_id == request_id)
    }

    pub fn position(&self, job_id: Uuid) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == job_id)
    }

    pub(crate) fn stale(&self, reason: impl Into<String>) -> ConductorError {
        ConductorError::StaleBatchApply {
            machine_id: self.machine_id.clone(),
            reason: reason.into(),
            current: self.jobs.clone(),
        }
    }

    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut QueueJob> {
        match self.position(job_id) {
            Some(idx) => Ok(&mut self.jobs[idx]),
            None => Err(self.stale(format!("job {} is not waiting on this machine", job_id))),
        }
    }

    fn renumber(&mut self) {
        for (idx, job) in self.jobs.iter_mut().enumerate() {
            job.order = idx as u32 + 1;
        }
    }

    pub fn push_back(&mut self, mut job: QueueJob) {
        job.machine_id = self.machine_id.clone();
        self.jobs.push(job);
        self.renumber();
    }

    /// Rewrite the order to exactly `ordered_ids`, which must be a permutation
    /// of the waiting job ids.
    pub fn reorder(&mut self, ordered_ids: &[Uuid]) -> Result<()> {
        let mut requested = ordered_ids.to_vec();
        requested.sort();
        requested.dedup();
        let mut active: Vec<Uuid> = self.jobs.iter().map(|j| j.id).collect();
        active.sort();
        if requested.len() != ordered_ids.len() || requested != active {
            return Err(self.stale("id set does not match the waiting jobs"));
        }

        let mut remaining = std::mem::take(&mut self.jobs);
        for id in ordered_ids {
            if let Some(idx) = remaining.iter().position(|j| j.id == *id) {
                self.jobs.push(remaining.swap_remove(idx));
            }
        }
        self.renumber();
        Ok(())
    }

    /// Move one job to a 1-based position, clamped to the list bounds.
    pub fn move_to(&mut self, job_id: Uuid, position: u32) -> Result<()> {
        let idx = self
            .position(job_id)
            .ok_or_else(|| self.stale(format!("job {} is not waiting on this machine", job_id)))?;
        let job = self.jobs.remove(idx);
        let target = (position.max(1) as usize - 1).min(self.jobs.len());
        self.jobs.insert(target, job);
        self.renumber();
        Ok(())
    }

    pub fn set_quantity(&mut self, job_id: Uuid, quantity: u32) -> Result<QueueJob> {
        if quantity == 0 {
            return Err(ConductorError::InvalidQuantity(quantity));
        }
        let job = self.job_mut(job_id)?;
        job.quantity = quantity;
        Ok(job.clone())
    }

    pub fn set_paused(&mut self, job_id: Uuid, paused: bool) -> Result<QueueJob> {
        let job = self.job_mut(job_id)?;
        job.paused = paused;
        Ok(job.clone())
    }

    pub fn remove(&mut self, job_id: Uuid) -> Result<QueueJob> {
        let idx = self
            .position(job_id)
            .ok_or_else(|| self.stale(format!("job {} is not waiting on this machine", job_id)))?;
        let job = self.jobs.remove(idx);
        self.renumber();
        Ok(job)
    }

    /// Drop every waiting job. The in-flight unit is untouched.
    pub fn clear(&mut self) -> usize {
        let removed = self.jobs.len();
        self.jobs.clear();
        removed
    }

    /// Remove waiting jobs of a request. Returns how many were removed.
    pub fn withdraw_request(&mut self, request_id: &str) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.request_id != request_id);
        self.renumber();
        before - self.jobs.len()
    }

    /// Drop waiting jobs of `request_id` cut from a program other than `program`.
    pub fn withdraw_superseded(&mut self, request_id: &str, program: &str) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|j| j.request_id != request_id || j.program == program);
        self.renumber();
        before - self.jobs.len()
    }

    /// Pop one unit of the lowest-order unpaused job into `in_flight`.
    ///
    /// A job with several units stays in place with its quantity decremented.
    /// Returns `None` when a unit is already in flight or nothing is eligible.
    pub fn take_unit(&mut self, now: DateTime<Utc>) -> Option<QueueJob> {
        if self.in_flight.is_some() {
            return None;
        }
        let idx = self.jobs.iter().position(|j| !j.paused)?;

        let unit = if self.jobs[idx].quantity > 1 {
            let job = &mut self.jobs[idx];
            job.quantity -= 1;
            let mut unit = job.clone();
            unit.quantity = 1;
            unit
        } else {
            let unit = self.jobs.remove(idx);
            self.renumber();
            unit
        };

        self.in_flight = Some(InFlight {
            job: unit.clone(),
            job_ref: None,
            state: InFlightState::Starting,
            dispatched_at: now,
            cancel_requested: false,
        });
        Some(unit)
    }

    /// Whether a job still has units waiting or parked on the failed shelf.
    pub fn has_remaining_units(&self, job_id: Uuid) -> bool {
        self.position(job_id).is_some() || self.failed.iter().any(|f| f.job.id == job_id)
    }

    /// Put the in-flight unit back at the head of the queue, merging it into
    /// its source job if that still waits.
    pub fn requeue_in_flight(&mut self) -> Option<QueueJob> {
        let unit = self.in_flight.take()?.job;
        match self.position(unit.id) {
            Some(idx) => {
                let mut job = self.jobs.remove(idx);
                job.quantity += 1;
                self.jobs.insert(0, job);
            }
            None => self.jobs.insert(0, unit.clone()),
        }
        self.renumber();
        Some(unit)
    }

    /// Park a failed unit on the shelf. Units of one job share a single entry
    /// whose quantity counts them. Returns the entry pushed out by
    /// [`FAILED_SHELF_LIMIT`], if any.
    pub fn shelve(&mut self, failed: FailedJob) -> Option<FailedJob> {
        if let Some(entry) = self.failed.iter_mut().find(|f| f.job.id == failed.job.id) {
            entry.job.quantity += failed.job.quantity;
            entry.job_ref = failed.job_ref;
            entry.reason = failed.reason;
            entry.failed_at = failed.failed_at;
            return None;
        }
        self.failed.push(failed);
        if self.failed.len() > FAILED_SHELF_LIMIT {
            Some(self.failed.remove(0))
        } else {
            None
        }
    }

    /// Move the in-flight unit, if any, onto the failed shelf. Returns the
    /// shelf entry pushed out by the limit.
    pub fn fail_in_flight(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Option<FailedJob> {
        let in_flight = self.in_flight.take()?;
        self.shelve(FailedJob {
            job: in_flight.job,
            job_ref: in_flight.job_ref,
            reason: reason.into(),
            failed_at: now,
        })
    }

    /// Clear the in-flight unit if `job_ref` matches it.
    pub fn finish_in_flight(&mut self, job_ref: &JobRef) -> Option<InFlight> {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.job_ref.as_ref() == Some(job_ref));
        if matches {
            self.in_flight.take()
        } else {
            None
        }
    }

    pub fn take_failed(&mut self, job_id: Uuid) -> Option<FailedJob> {
        let idx = self.failed.iter().position(|f| f.job.id == job_id)?;
        Some(self.failed.remove(idx))
    }

    /// Return a shelved job's units to the queue: into its source job if that
    /// still waits, otherwise appended unpaused at the end.
    pub fn restore_failed(&mut self, job_id: Uuid) -> Option<QueueJob> {
        let failed = self.take_failed(job_id)?;
        if let Some(idx) = self.position(job_id) {
            let waiting = &mut self.jobs[idx];
            waiting.quantity += failed.job.quantity;
            return Some(waiting.clone());
        }
        let mut job = failed.job;
        job.paused = false;
        self.push_back(job);
        self.jobs.last().cloned()
    }
}
