use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bridge::{
    BridgeClient, CompletionEvent, CompletionOutcome, JobRef, MachiningLog, RecordStatus,
};
use crate::error::{ConductorError, Result};
use crate::machine::{MachineRegistry, MachineStatus};
use crate::queue::{InFlight, InFlightState, ProductionQueue};
use crate::stage::StageStateMachine;

/// Drives every machine's queue onto hardware.
///
/// Per machine: poll status, resolve an unconfirmed unit, then start the next
/// eligible job if the machine is idle, allows starts and has nothing in
/// flight. All of this runs under a per-machine lock, so completions and
/// ticks for one machine never interleave while different machines proceed
/// in parallel.
pub struct Dispatcher {
    machines: Arc<MachineRegistry>,
    queue: Arc<ProductionQueue>,
    bridge: BridgeClient,
    records: Arc<MachiningLog>,
    stages: Arc<StageStateMachine>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        machines: Arc<MachineRegistry>,
        queue: Arc<ProductionQueue>,
        bridge: BridgeClient,
        records: Arc<MachiningLog>,
        stages: Arc<StageStateMachine>,
    ) -> Self {
        Self {
            machines,
            queue,
            bridge,
            records,
            stages,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn machine_lock(&self, machine_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(machine_id.to_string())
            .or_default()
            .clone()
    }

    /// Treat every unit left in flight by a previous leader as unconfirmed, so
    /// the first poll decides its fate instead of assuming an outcome.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for machine_id in self.machines.ids().await {
            let queue = self.queue.snapshot(&machine_id).await?;
            if let Some(in_flight) = queue.in_flight {
                if in_flight.state != InFlightState::Uncertain {
                    self.queue
                        .set_in_flight(&machine_id, None, InFlightState::Uncertain)
                        .await?;
                }
                tracing::info!(
                    machine_id = %machine_id,
                    job_id = %in_flight.job.id,
                    job_ref = ?in_flight.job_ref,
                    "In-flight unit will be resolved by the next poll"
                );
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// One dispatch pass over all machines. Returns how many units were started.
    ///
    /// Bridge errors only affect their own machine and are logged; any other
    /// error is returned after every machine has been serviced.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        let mut set = JoinSet::new();
        for machine_id in self.machines.ids().await {
            let this = Arc::clone(self);
            set.spawn(async move {
                let res = this.service_machine(&machine_id).await;
                (machine_id, res)
            });
        }

        let mut started = 0;
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(Some(_)))) => started += 1,
                Ok((_, Ok(None))) => {}
                Ok((machine_id, Err(e))) => match e {
                    ConductorError::BridgeTimeout { .. } | ConductorError::BridgeRejected { .. } => {
                        tracing::warn!(machine_id = %machine_id, error = %e, "Dispatch attempt failed");
                    }
                    e => {
                        tracing::error!(machine_id = %machine_id, error = %e, "Machine service failed");
                        first_error.get_or_insert(e);
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "Dispatch task panicked");
                    first_error.get_or_insert(ConductorError::Internal(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(started),
        }
    }

    /// Poll one machine and start its next job if possible.
    pub async fn service_machine(&self, machine_id: &str) -> Result<Option<JobRef>> {
        let lock = self.machine_lock(machine_id).await;
        let _guard = lock.lock().await;
        self.service_locked(machine_id).await
    }

    async fn service_locked(&self, machine_id: &str) -> Result<Option<JobRef>> {
        let status = match self.bridge.poll_status(machine_id).await {
            Ok(status) => status,
            Err(e) => {
                if matches!(e, ConductorError::BridgeTimeout { .. }) {
                    self.machines
                        .set_status(machine_id, MachineStatus::Unknown)
                        .await?;
                }
                return Err(e);
            }
        };
        self.machines.set_status(machine_id, status).await?;
        self.resolve_in_flight(machine_id, status).await?;
        self.dispatch_next(machine_id).await
    }

    async fn resolve_in_flight(&self, machine_id: &str, status: MachineStatus) -> Result<()> {
        let Some(in_flight) = self.queue.snapshot(machine_id).await?.in_flight else {
            return Ok(());
        };

        if in_flight.cancel_requested {
            if matches!(status, MachineStatus::Running | MachineStatus::Unknown) {
                if let Err(e) = self.bridge.stop(machine_id).await {
                    tracing::warn!(machine_id, error = %e, "Stop of cancelled job failed");
                }
            }
            let rejected = ConductorError::BridgeRejected {
                machine_id: machine_id.to_string(),
                reason: "request cancelled".to_string(),
            };
            return self
                .fail_unit(machine_id, &in_flight, &rejected.to_string(), RecordStatus::Canceled)
                .await;
        }

        if in_flight.state == InFlightState::Running {
            return Ok(());
        }

        match (status, &in_flight.job_ref) {
            (MachineStatus::Running, Some(job_ref)) => {
                self.queue
                    .set_in_flight(machine_id, None, InFlightState::Running)
                    .await?;
                self.records
                    .open(machine_id, job_ref, Some(in_flight.job.request_id.clone()))
                    .await?;
                tracing::info!(machine_id, job_ref = %job_ref, "Unconfirmed job is running");
            }
            (MachineStatus::Idle, job_ref) => {
                let record = match job_ref {
                    Some(job_ref) => self.records.get(job_ref).await,
                    None => None,
                };
                match record.map(|r| (r.status, r.reason)) {
                    Some((RecordStatus::Completed, _)) => {
                        let event = CompletionEvent::success(machine_id, record_ref(&in_flight)?);
                        self.complete_locked(event).await?;
                    }
                    Some((RecordStatus::Failed, reason)) => {
                        let reason = reason.unwrap_or_else(|| "machining failed".to_string());
                        let event = CompletionEvent::fail(machine_id, record_ref(&in_flight)?, reason);
                        self.complete_locked(event).await?;
                    }
                    _ => {
                        self.queue.requeue_in_flight(machine_id).await?;
                        tracing::info!(
                            machine_id,
                            job_id = %in_flight.job.id,
                            "Unconfirmed job did not start, returned to head of queue"
                        );
                    }
                }
            }
            (MachineStatus::Alarm | MachineStatus::Error, _) => {
                let reason = format!("machine reported {} before start was confirmed", status);
                self.fail_unit(machine_id, &in_flight, &reason, RecordStatus::Failed)
                    .await?;
            }
            _ => {
                tracing::debug!(machine_id, status = %status, "In-flight unit still unresolved");
            }
        }
        Ok(())
    }

    async fn fail_unit(
        &self,
        machine_id: &str,
        in_flight: &InFlight,
        reason: &str,
        record_status: RecordStatus,
    ) -> Result<()> {
        self.queue.fail_in_flight(machine_id, reason).await?;
        if let Some(job_ref) = &in_flight.job_ref {
            self.records
                .finish(machine_id, job_ref, record_status, Some(reason.to_string()))
                .await?;
        }
        tracing::warn!(
            machine_id,
            job_id = %in_flight.job.id,
            request_id = %in_flight.job.request_id,
            reason,
            "Job moved to failed list"
        );
        Ok(())
    }

    async fn dispatch_next(&self, machine_id: &str) -> Result<Option<JobRef>> {
        let machine = self.machines.get(machine_id).await?;
        if !machine.can_start() {
            tracing::trace!(machine_id, status = %machine.status, "Machine not ready for a job");
            return Ok(None);
        }
        let Some(unit) = self.queue.begin_dispatch(machine_id).await? else {
            return Ok(None);
        };
        tracing::info!(
            machine_id,
            job_id = %unit.id,
            request_id = %unit.request_id,
            "Dispatching job"
        );

        let job_ref = match self.bridge.upload(machine_id, &unit.program).await {
            Ok(job_ref) => job_ref,
            Err(e) => return Err(self.dispatch_failed(machine_id, None, e).await),
        };
        self.queue
            .set_in_flight(machine_id, Some(&job_ref), InFlightState::Starting)
            .await?;

        if let Err(e) = self.bridge.start(machine_id, &job_ref).await {
            return Err(self.dispatch_failed(machine_id, Some(&job_ref), e).await);
        }
        self.queue
            .set_in_flight(machine_id, None, InFlightState::Running)
            .await?;
        self.machines
            .set_status(machine_id, MachineStatus::Running)
            .await?;
        self.records
            .open(machine_id, &job_ref, Some(unit.request_id.clone()))
            .await?;

        tracing::info!(machine_id, job_id = %unit.id, job_ref = %job_ref, "Job started");
        Ok(Some(job_ref))
    }

    /// Leave the queue inspectable after a failed upload or start: a timeout
    /// marks the machine `unknown` and the unit unconfirmed, a refusal moves
    /// the unit to the failed list.
    async fn dispatch_failed(
        &self,
        machine_id: &str,
        job_ref: Option<&JobRef>,
        error: ConductorError,
    ) -> ConductorError {
        let handled = match &error {
            ConductorError::BridgeTimeout { .. } => {
                let marked = self
                    .machines
                    .set_status(machine_id, MachineStatus::Unknown)
                    .await;
                match marked {
                    Ok(()) => {
                        self.queue
                            .set_in_flight(machine_id, job_ref, InFlightState::Uncertain)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            e => self.queue.fail_in_flight(machine_id, &e.to_string()).await,
        };
        if let Err(e) = handled {
            tracing::error!(machine_id, error = %e, "Failed to record dispatch failure");
        }
        error
    }

    /// Apply a completion from the bridge and immediately try the next job.
    pub async fn handle_completion(&self, event: CompletionEvent) -> Result<()> {
        let machine_id = event.machine_id.clone();
        let lock = self.machine_lock(&machine_id).await;
        let _guard = lock.lock().await;

        if !self.complete_locked(event).await? {
            return Ok(());
        }
        if let Err(e) = self.service_locked(&machine_id).await {
            tracing::warn!(machine_id = %machine_id, error = %e, "Back-to-back dispatch failed");
        }
        Ok(())
    }

    /// Returns whether the event matched the machine's in-flight unit.
    async fn complete_locked(&self, event: CompletionEvent) -> Result<bool> {
        let CompletionEvent {
            machine_id,
            job_ref,
            outcome,
        } = event;
        let failure = match &outcome {
            CompletionOutcome::Success => None,
            CompletionOutcome::Fail(reason) => Some(reason.as_str()),
        };

        let Some(finished) = self
            .queue
            .finish_in_flight(&machine_id, &job_ref, failure)
            .await?
        else {
            tracing::warn!(
                machine_id = %machine_id,
                job_ref = %job_ref,
                "Completion does not match the in-flight job, ignored"
            );
            return Ok(false);
        };

        let unit = &finished.unit.job;
        match outcome {
            CompletionOutcome::Success => {
                self.records
                    .finish(&machine_id, &job_ref, RecordStatus::Completed, None)
                    .await?;
                tracing::info!(
                    machine_id = %machine_id,
                    job_id = %unit.id,
                    job_ref = %job_ref,
                    more_units = finished.more_units,
                    "Job completed"
                );
                if !finished.more_units && !finished.unit.cancel_requested {
                    if let Err(e) = self
                        .stages
                        .record_machining_complete(&unit.request_id, &job_ref, &unit.program)
                        .await
                    {
                        tracing::warn!(
                            request_id = %unit.request_id,
                            error = %e,
                            "Could not record machining completion"
                        );
                    }
                }
            }
            CompletionOutcome::Fail(reason) => {
                self.records
                    .finish(&machine_id, &job_ref, RecordStatus::Failed, Some(reason.clone()))
                    .await?;
                tracing::warn!(
                    machine_id = %machine_id,
                    job_id = %unit.id,
                    job_ref = %job_ref,
                    reason = %reason,
                    "Job failed on machine"
                );
            }
        }
        Ok(true)
    }

    /// Consume completions until cancelled or the channel closes.
    pub async fn run_completions(
        self: Arc<Self>,
        mut completions: mpsc::Receiver<CompletionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = completions.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_completion(event).await {
                            tracing::error!(error = %e, "Failed to apply completion");
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Completion loop stopped");
    }

    /// Operator stop. The bridge reports the interrupted job as failed.
    pub async fn stop_machine(&self, machine_id: &str) -> Result<()> {
        self.machines.get(machine_id).await?;
        self.bridge.stop(machine_id).await?;
        tracing::info!(machine_id, "Machine stop requested");
        Ok(())
    }

    /// Operator reset of an alarm, followed by a fresh poll.
    pub async fn reset_machine(&self, machine_id: &str) -> Result<Option<JobRef>> {
        self.machines.get(machine_id).await?;
        self.bridge.reset(machine_id).await?;
        tracing::info!(machine_id, "Machine reset requested");
        self.service_machine(machine_id).await
    }
}

fn record_ref(in_flight: &InFlight) -> Result<JobRef> {
    in_flight
        .job_ref
        .clone()
        .ok_or_else(|| ConductorError::Internal("in-flight unit has no job reference".into()))
}
