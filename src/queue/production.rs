use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{ConductorError, Result};
use crate::machine::{Machine, MachineRegistry, MachineStatus};
use crate::queue::{ProductionQueue, QueueJob};
use crate::stage::{ManufacturingRequest, Stage, StageEvent, StageStateMachine};

/// Feeds machining-ready requests into machine queues.
pub struct ProductionScheduler {
    machines: Arc<MachineRegistry>,
    queue: Arc<ProductionQueue>,
    stages: Arc<StageStateMachine>,
}

impl ProductionScheduler {
    pub fn new(
        machines: Arc<MachineRegistry>,
        queue: Arc<ProductionQueue>,
        stages: Arc<StageStateMachine>,
    ) -> Self {
        Self {
            machines,
            queue,
            stages,
        }
    }

    /// Choose a machine for `request`: its assigned machine if set, otherwise
    /// the shallowest queue among machines loaded with a matching diameter
    /// group (ties go to the lowest machine id).
    async fn pick_machine(&self, request: &ManufacturingRequest) -> Result<Option<Machine>> {
        if let Some(machine_id) = &request.assigned_machine {
            return self.machines.get(machine_id).await.map(Some);
        }
        let Some(group) = request.diameter_group.as_deref() else {
            return Ok(None);
        };

        let depths = self.queue.depth_by_machine().await;
        let mut candidates: Vec<(usize, Machine)> = self
            .machines
            .list()
            .await
            .into_iter()
            .filter(|m| m.diameter_group() == Some(group))
            .filter(|m| !matches!(m.status, MachineStatus::Alarm | MachineStatus::Error))
            .map(|m| (depths.get(&m.id).copied().unwrap_or(0), m))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        Ok(candidates.into_iter().next().map(|(_, m)| m))
    }

    /// Enqueue every eligible request. Returns how many jobs were created.
    pub async fn feed(&self) -> Result<usize> {
        let mut fed = 0;
        for request in self.stages.machining_candidates().await {
            let Some(program) = request.artifact(Stage::Machining).map(|a| a.key.clone()) else {
                continue;
            };
            if self.queue.contains_request(&request.id).await {
                let removed = self.queue.withdraw_superseded(&request.id, &program).await?;
                if removed > 0 {
                    tracing::info!(request_id = %request.id, removed, "Superseded jobs withdrawn");
                }
                if self.queue.contains_request(&request.id).await {
                    continue;
                }
            }
            let Some(machine) = self.pick_machine(&request).await? else {
                tracing::debug!(
                    request_id = %request.id,
                    diameter_group = ?request.diameter_group,
                    "No machine available for request"
                );
                continue;
            };

            let job = QueueJob::new(&machine.id, &request.id, program).with_quantity(request.quantity);
            let job = match self.queue.enqueue(job, false).await {
                Ok(job) => job,
                Err(e @ (ConductorError::MachineUnavailable { .. } | ConductorError::QueueFull { .. })) => {
                    tracing::warn!(request_id = %request.id, machine_id = %machine.id, error = %e, "Request not enqueued");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.stages
                .mark_queued(&request.id, &machine.id, job.id)
                .await?;
            fed += 1;
        }
        if fed > 0 {
            tracing::info!(jobs = fed, "Production scheduler fed machine queues");
        }
        Ok(fed)
    }

    /// Cancel a request: its waiting jobs go away, an in-flight unit is
    /// stopped at the next poll, and the request is archived.
    pub async fn cancel_request(
        &self,
        request_id: &str,
        actor: &str,
        reason: Option<String>,
    ) -> Result<ManufacturingRequest> {
        self.stages.get(request_id).await?;
        self.queue.cancel_request(request_id).await?;
        self.stages.cancel(request_id, actor, reason).await
    }

    /// React to stage changes. Jobs of a request rolled back out of machining
    /// are withdrawn, a replaced machining program re-queues the request, and
    /// requests that just became ready are fed.
    pub async fn on_stage_event(&self, event: &StageEvent) -> Result<()> {
        match event {
            StageEvent::ArtifactReplaced {
                request_id,
                stage: Stage::Machining,
            } => {
                tracing::debug!(request_id = %request_id, "Machining program replaced");
                self.feed().await?;
            }
            StageEvent::RolledBack { request_id, from, to }
                if *from >= Stage::Machining && *to <= Stage::Machining =>
            {
                let removed = self.queue.withdraw_request(request_id).await?;
                if removed > 0 {
                    tracing::info!(request_id = %request_id, removed, "Jobs withdrawn after rollback");
                }
                if *to == Stage::Machining {
                    self.feed().await?;
                }
            }
            StageEvent::Advanced {
                to: Stage::Machining,
                ..
            } => {
                self.feed().await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Follow stage events until cancelled.
    pub async fn run_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<StageEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.on_stage_event(&event).await {
                            tracing::warn!(error = %e, "Failed to react to stage event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Stage events dropped, next production tick catches up");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}
