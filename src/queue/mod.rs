//! Per-machine production queues.
//!
//! Each machine owns one [`MachineQueue`] document. Every mutation runs under
//! that document's lock and commits through a conditional write, so a batch
//! either lands completely or not at all, and a write computed by a lagging
//! ex-leader is refused by the store.

pub mod batch;
pub mod dispatch;
pub mod job;
pub mod machine_queue;
pub mod production;

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::bridge::JobRef;
use crate::clock::Clock;
use crate::error::{ConductorError, Result};
use crate::machine::{MachineRegistry, MachineStatus};
use crate::store::{Collection, StateStore};

pub use batch::{BatchOp, BatchOpKind};
pub use dispatch::Dispatcher;
pub use job::{FailedJob, InFlight, InFlightState, JobKind, QueueJob};
pub use machine_queue::MachineQueue;
pub use production::ProductionScheduler;

/// Outcome of removing a finished unit from a machine.
#[derive(Debug, Clone)]
pub struct FinishedUnit {
    pub unit: InFlight,
    /// The source job still has units waiting or on the failed shelf
    pub more_units: bool,
}

pub struct ProductionQueue {
    queues: Collection<MachineQueue>,
    machines: Arc<MachineRegistry>,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl ProductionQueue {
    pub fn new(
        store: Arc<dyn StateStore>,
        machines: Arc<MachineRegistry>,
        clock: Arc<dyn Clock>,
        capacity: usize,
    ) -> Self {
        Self {
            queues: Collection::new(store, "queue/"),
            machines,
            clock,
            capacity,
        }
    }

    pub async fn load(&self) -> Result<usize> {
        self.queues.load_all().await
    }

    async fn update<R>(
        &self,
        machine_id: &str,
        f: impl FnOnce(&mut MachineQueue) -> Result<R>,
    ) -> Result<R> {
        self.queues
            .update(machine_id, f)
            .await?
            .ok_or_else(|| ConductorError::MachineNotFound(machine_id.to_string()))
    }

    /// Current queue document of a machine; empty if it never had a job.
    pub async fn snapshot(&self, machine_id: &str) -> Result<MachineQueue> {
        if let Some(queue) = self.queues.get(machine_id).await {
            return Ok(queue);
        }
        self.machines.get(machine_id).await?;
        Ok(MachineQueue::new(machine_id))
    }

    pub async fn jobs(&self, machine_id: &str) -> Result<Vec<QueueJob>> {
        Ok(self.snapshot(machine_id).await?.jobs)
    }

    pub async fn depth_by_machine(&self) -> BTreeMap<String, usize> {
        let mut depths = BTreeMap::new();
        for id in self.machines.ids().await {
            depths.insert(id, 0);
        }
        for queue in self.queues.values().await {
            depths.insert(queue.machine_id.clone(), queue.depth());
        }
        depths
    }

    pub async fn contains_request(&self, request_id: &str) -> bool {
        self.queues
            .values()
            .await
            .iter()
            .any(|q| q.contains_request(request_id))
    }

    async fn find_machine(&self, job_id: Uuid) -> Result<String> {
        for queue in self.queues.values().await {
            if queue.position(job_id).is_some() {
                return Ok(queue.machine_id);
            }
        }
        Err(ConductorError::JobNotFound(job_id))
    }

    /// Append a job at the end of the machine's queue.
    ///
    /// Machines in `alarm` or `error` refuse new work unless `force` is set.
    /// `created_at` is stamped here.
    pub async fn enqueue(&self, mut job: QueueJob, force: bool) -> Result<QueueJob> {
        if job.quantity == 0 {
            return Err(ConductorError::InvalidQuantity(job.quantity));
        }
        job.created_at = self.clock.now();
        let machine = self.machines.get(&job.machine_id).await?;
        if matches!(machine.status, MachineStatus::Alarm | MachineStatus::Error) && !force {
            return Err(ConductorError::MachineUnavailable {
                machine_id: machine.id,
                status: machine.status,
            });
        }

        let machine_id = machine.id;
        self.queues
            .ensure(&machine_id, || MachineQueue::new(&machine_id))
            .await?;
        let capacity = self.capacity;
        let job = self
            .update(&machine_id, |q| {
                if q.jobs.len() >= capacity {
                    return Err(ConductorError::QueueFull {
                        machine_id: q.machine_id.clone(),
                        capacity,
                    });
                }
                if q.position(job.id).is_some() {
                    return Err(ConductorError::InvalidRequest(format!(
                        "job {} is already waiting on {}",
                        job.id, q.machine_id
                    )));
                }
                q.push_back(job);
                Ok(q.jobs.last().cloned())
            })
            .await?
            .ok_or_else(|| ConductorError::Internal("enqueued job missing".into()))?;

        tracing::info!(
            machine_id = %machine_id,
            job_id = %job.id,
            request_id = %job.request_id,
            order = job.order,
            quantity = job.quantity,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Rewrite the order to exactly `ordered_ids`.
    pub async fn reorder(&self, machine_id: &str, ordered_ids: &[Uuid]) -> Result<Vec<QueueJob>> {
        if !self.queues.contains(machine_id).await {
            let queue = self.snapshot(machine_id).await?;
            queue.clone().reorder(ordered_ids)?;
            return Ok(queue.jobs);
        }
        self.update(machine_id, |q| {
            q.reorder(ordered_ids)?;
            Ok(q.jobs.clone())
        })
        .await
    }

    pub async fn set_qty(&self, job_id: Uuid, quantity: u32) -> Result<QueueJob> {
        if quantity == 0 {
            return Err(ConductorError::InvalidQuantity(quantity));
        }
        let machine_id = self.find_machine(job_id).await?;
        self.update(&machine_id, |q| q.set_quantity(job_id, quantity))
            .await
    }

    pub async fn pause(&self, job_id: Uuid, paused: bool) -> Result<QueueJob> {
        let machine_id = self.find_machine(job_id).await?;
        let job = self
            .update(&machine_id, |q| q.set_paused(job_id, paused))
            .await?;
        tracing::info!(machine_id = %machine_id, job_id = %job_id, paused, "Job pause changed");
        Ok(job)
    }

    pub async fn remove(&self, job_id: Uuid) -> Result<QueueJob> {
        let machine_id = self.find_machine(job_id).await?;
        self.update(&machine_id, |q| q.remove(job_id)).await
    }

    /// Remove all waiting jobs; the in-flight unit keeps running.
    pub async fn clear(&self, machine_id: &str) -> Result<usize> {
        if !self.queues.contains(machine_id).await {
            self.machines.get(machine_id).await?;
            return Ok(0);
        }
        let removed = self.update(machine_id, |q| Ok(q.clear())).await?;
        tracing::info!(machine_id, removed, "Queue cleared");
        Ok(removed)
    }

    /// Apply a list of operations atomically and return the resulting order.
    pub async fn batch_apply(&self, machine_id: &str, ops: &[BatchOp]) -> Result<Vec<QueueJob>> {
        if !self.queues.contains(machine_id).await {
            let mut queue = self.snapshot(machine_id).await?;
            batch::apply_all(&mut queue, ops)?;
            return Ok(queue.jobs);
        }
        let jobs = self
            .update(machine_id, |q| {
                batch::apply_all(q, ops)?;
                Ok(q.jobs.clone())
            })
            .await?;
        tracing::info!(machine_id, ops = ops.len(), remaining = jobs.len(), "Batch applied");
        Ok(jobs)
    }

    pub async fn failed(&self, machine_id: &str) -> Result<Vec<FailedJob>> {
        Ok(self.snapshot(machine_id).await?.failed)
    }

    /// Put a failed job's units back: into the source job if it still waits,
    /// otherwise at the end of the queue.
    pub async fn retry_failed(&self, machine_id: &str, job_id: Uuid) -> Result<QueueJob> {
        let capacity = self.capacity;
        let job = self
            .update(machine_id, |q| {
                if !q.failed.iter().any(|f| f.job.id == job_id) {
                    return Err(ConductorError::JobNotFound(job_id));
                }
                if q.position(job_id).is_none() && q.jobs.len() >= capacity {
                    return Err(ConductorError::QueueFull {
                        machine_id: q.machine_id.clone(),
                        capacity,
                    });
                }
                Ok(q.restore_failed(job_id))
            })
            .await?
            .ok_or(ConductorError::JobNotFound(job_id))?;
        tracing::info!(
            machine_id,
            job_id = %job_id,
            order = job.order,
            quantity = job.quantity,
            "Failed job requeued"
        );
        Ok(job)
    }

    pub async fn discard_failed(&self, machine_id: &str, job_id: Uuid) -> Result<FailedJob> {
        self.update(machine_id, |q| {
            q.take_failed(job_id).ok_or(ConductorError::JobNotFound(job_id))
        })
        .await
    }

    /// Drop waiting jobs of a request on every machine without touching an
    /// in-flight unit. Returns how many jobs were removed.
    pub async fn withdraw_request(&self, request_id: &str) -> Result<usize> {
        let mut removed = 0;
        for queue in self.queues.values().await {
            if queue.jobs.iter().any(|j| j.request_id == request_id) {
                removed += self
                    .update(&queue.machine_id, |q| Ok(q.withdraw_request(request_id)))
                    .await?;
            }
        }
        Ok(removed)
    }

    /// Withdraw waiting jobs of `request_id` that run an outdated program.
    pub async fn withdraw_superseded(&self, request_id: &str, program: &str) -> Result<usize> {
        let mut removed = 0;
        for queue in self.queues.values().await {
            let superseded = queue
                .jobs
                .iter()
                .any(|j| j.request_id == request_id && j.program != program);
            if superseded {
                removed += self
                    .update(&queue.machine_id, |q| {
                        Ok(q.withdraw_superseded(request_id, program))
                    })
                    .await?;
            }
        }
        Ok(removed)
    }

    /// Withdraw a cancelled request: waiting jobs are removed and an in-flight
    /// unit is flagged so the next status poll stops and fails it. Returns the
    /// machines with a flagged unit.
    pub async fn cancel_request(&self, request_id: &str) -> Result<Vec<String>> {
        let removed = self.withdraw_request(request_id).await?;
        let mut flagged = Vec::new();
        for queue in self.queues.values().await {
            let in_flight = queue
                .in_flight
                .as_ref()
                .is_some_and(|f| f.job.request_id == request_id);
            if in_flight {
                self.update(&queue.machine_id, |q| {
                    if let Some(f) = q.in_flight.as_mut() {
                        if f.job.request_id == request_id {
                            f.cancel_requested = true;
                        }
                    }
                    Ok(())
                })
                .await?;
                flagged.push(queue.machine_id);
            }
        }
        tracing::info!(request_id, removed, flagged = ?flagged, "Request withdrawn from queues");
        Ok(flagged)
    }

    // Dispatch-side transitions, used by the dispatch loop only.

    pub(crate) async fn begin_dispatch(&self, machine_id: &str) -> Result<Option<QueueJob>> {
        if !self.queues.contains(machine_id).await {
            return Ok(None);
        }
        let now = self.clock.now();
        self.update(machine_id, |q| Ok(q.take_unit(now))).await
    }

    pub(crate) async fn set_in_flight(
        &self,
        machine_id: &str,
        job_ref: Option<&JobRef>,
        state: InFlightState,
    ) -> Result<()> {
        self.update(machine_id, |q| {
            if let Some(f) = q.in_flight.as_mut() {
                if let Some(job_ref) = job_ref {
                    f.job_ref = Some(job_ref.clone());
                }
                f.state = state;
            }
            Ok(())
        })
        .await
    }

    pub(crate) async fn requeue_in_flight(&self, machine_id: &str) -> Result<Option<QueueJob>> {
        self.update(machine_id, |q| Ok(q.requeue_in_flight())).await
    }

    pub(crate) async fn fail_in_flight(&self, machine_id: &str, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let evicted = self
            .update(machine_id, |q| Ok(q.fail_in_flight(reason, now)))
            .await?;
        log_evicted(machine_id, evicted);
        Ok(())
    }

    /// Remove the in-flight unit if `job_ref` is the one it carries. A failed
    /// unit is moved to the failed shelf.
    pub(crate) async fn finish_in_flight(
        &self,
        machine_id: &str,
        job_ref: &JobRef,
        failure: Option<&str>,
    ) -> Result<Option<FinishedUnit>> {
        let now = self.clock.now();
        let finished = self
            .update(machine_id, |q| {
                let Some(unit) = q.finish_in_flight(job_ref) else {
                    return Ok(None);
                };
                let evicted = failure.and_then(|reason| {
                    q.shelve(FailedJob {
                        job: unit.job.clone(),
                        job_ref: unit.job_ref.clone(),
                        reason: reason.to_string(),
                        failed_at: now,
                    })
                });
                let more_units = q.has_remaining_units(unit.job.id);
                Ok(Some((FinishedUnit { unit, more_units }, evicted)))
            })
            .await?;
        Ok(finished.map(|(finished, evicted)| {
            log_evicted(machine_id, evicted);
            finished
        }))
    }
}

fn log_evicted(machine_id: &str, evicted: Option<FailedJob>) {
    if let Some(old) = evicted {
        tracing::warn!(
            machine_id,
            job_id = %old.job.id,
            request_id = %old.job.request_id,
            "Failed list full, oldest entry dropped"
        );
    }
}
