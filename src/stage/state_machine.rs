use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::bridge::JobRef;
use crate::clock::Clock;
use crate::error::{ConductorError, Result};
use crate::stage::request::{Artifact, ManufacturingRequest, ReviewStatus, Stage};
use crate::store::{Collection, StateStore};

const EVENT_CAPACITY: usize = 256;

/// Stage change published after it has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    Advanced {
        request_id: String,
        from: Stage,
        to: Stage,
    },
    RolledBack {
        request_id: String,
        from: Stage,
        to: Stage,
    },
    /// An artifact was uploaded over an existing one
    ArtifactReplaced {
        request_id: String,
        stage: Stage,
    },
    Archived {
        request_id: String,
        cancelled: bool,
    },
}

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub id: String,
    /// Key of the order design that admits the request
    pub design_key: String,
    pub created_by: String,
    pub diameter_group: Option<String>,
    pub quantity: u32,
    pub assigned_machine: Option<String>,
}

impl NewRequest {
    pub fn new(id: impl Into<String>, design_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            design_key: design_key.into(),
            created_by: "system".to_string(),
            diameter_group: None,
            quantity: 1,
            assigned_machine: None,
        }
    }

    pub fn with_diameter_group(mut self, group: impl Into<String>) -> Self {
        self.diameter_group = Some(group.into());
        self
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }
}

fn invalid(request: &ManufacturingRequest, reason: impl Into<String>) -> ConductorError {
    ConductorError::InvalidTransition {
        request_id: request.id.clone(),
        reason: reason.into(),
        current: Box::new(request.clone()),
    }
}

/// Move to the next stage if its artifact is ready and the current gate is approved.
fn auto_advance(request: &mut ManufacturingRequest, events: &mut Vec<StageEvent>) {
    if request.advance_blocker().is_some() {
        return;
    }
    if let Some(next) = request.stage.next() {
        events.push(StageEvent::Advanced {
            request_id: request.id.clone(),
            from: request.stage,
            to: next,
        });
        request.stage = next;
    }
}

/// Owner of every request's `stage` and review gates.
///
/// Mutations of one request are serialized by its document lock and commit
/// through a conditional write; a refused transition leaves the request
/// untouched and reports its current state.
pub struct StageStateMachine {
    requests: Collection<ManufacturingRequest>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<StageEvent>,
}

impl StageStateMachine {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            requests: Collection::new(store, "request/"),
            clock,
            events,
        }
    }

    pub async fn load(&self) -> Result<usize> {
        self.requests.load_all().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, request_id: &str) -> Result<ManufacturingRequest> {
        self.requests
            .get(request_id)
            .await
            .ok_or_else(|| ConductorError::RequestNotFound(request_id.to_string()))
    }

    pub async fn list(&self) -> Vec<ManufacturingRequest> {
        self.requests.values().await
    }

    /// Requests waiting to be put on a machine.
    pub async fn machining_candidates(&self) -> Vec<ManufacturingRequest> {
        self.requests
            .values()
            .await
            .into_iter()
            .filter(ManufacturingRequest::machining_eligible)
            .collect()
    }

    pub async fn create(&self, new: NewRequest) -> Result<ManufacturingRequest> {
        if new.quantity == 0 {
            return Err(ConductorError::InvalidQuantity(new.quantity));
        }
        let now = self.clock.now();
        let mut stage_files = BTreeMap::new();
        stage_files.insert(
            Stage::Request,
            Artifact::new(new.design_key, &new.created_by, now),
        );
        let request = ManufacturingRequest {
            id: new.id.clone(),
            stage: Stage::Request,
            review_by_stage: BTreeMap::new(),
            stage_files,
            assigned_machine: new.assigned_machine,
            diameter_group: new.diameter_group,
            quantity: new.quantity,
            queued_job: None,
            rollback_count: BTreeMap::new(),
            archived: false,
            cancelled: false,
            created_at: now,
            updated_at: now,
        };
        self.requests
            .insert(&new.id, request.clone())
            .await
            .map_err(|e| match e {
                ConductorError::StoreConflict { .. } => {
                    ConductorError::InvalidRequest(format!("request {} already exists", new.id))
                }
                e => e,
            })?;
        tracing::info!(request_id = %new.id, "Request created");
        Ok(request)
    }

    /// Apply `f` to a live request, persist, then publish the events it produced.
    async fn mutate<F>(&self, request_id: &str, f: F) -> Result<ManufacturingRequest>
    where
        F: FnOnce(&mut ManufacturingRequest, DateTime<Utc>, &mut Vec<StageEvent>) -> Result<()>,
    {
        let now = self.clock.now();
        let (request, events) = self
            .requests
            .update(request_id, |r| {
                if r.archived {
                    return Err(invalid(r, "request is archived"));
                }
                let mut events = Vec::new();
                f(r, now, &mut events)?;
                r.updated_at = now;
                Ok((r.clone(), events))
            })
            .await?
            .ok_or_else(|| ConductorError::RequestNotFound(request_id.to_string()))?;

        for event in events {
            match &event {
                StageEvent::Advanced { from, to, .. } => {
                    tracing::info!(request_id, from = %from, to = %to, "Stage advanced");
                }
                StageEvent::RolledBack { from, to, .. } => {
                    tracing::warn!(request_id, from = %from, to = %to, "Stage rolled back");
                }
                StageEvent::ArtifactReplaced { stage, .. } => {
                    tracing::info!(request_id, stage = %stage, "Artifact replaced");
                }
                StageEvent::Archived { cancelled, .. } => {
                    tracing::info!(request_id, cancelled, "Request archived");
                }
            }
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        Ok(request)
    }

    /// Explicitly move to `target`, which must be the next stage.
    pub async fn advance(&self, request_id: &str, target: Stage) -> Result<ManufacturingRequest> {
        self.mutate(request_id, |r, _, events| {
            if r.stage.next() != Some(target) {
                return Err(invalid(
                    r,
                    format!("cannot move from {} to {}", r.stage, target),
                ));
            }
            if let Some(blocker) = r.advance_blocker() {
                return Err(invalid(r, blocker));
            }
            auto_advance(r, events);
            Ok(())
        })
        .await
    }

    /// Store (or replace) the artifact that admits `stage`.
    ///
    /// The artifact's review returns to PENDING. Replacing an artifact the
    /// request has already passed rolls it back to that stage; uploading the
    /// next stage's artifact advances when the current gate is approved.
    pub async fn put_artifact(
        &self,
        request_id: &str,
        stage: Stage,
        key: &str,
        actor: &str,
    ) -> Result<ManufacturingRequest> {
        self.mutate(request_id, |r, now, events| {
            let replaced = r.stage_files.insert(stage, Artifact::new(key, actor, now));
            r.set_review(stage, ReviewStatus::Pending, actor, None, now);
            if stage == Stage::Machining {
                r.queued_job = None;
            }
            if replaced.is_some() {
                events.push(StageEvent::ArtifactReplaced {
                    request_id: r.id.clone(),
                    stage,
                });
            }

            if stage < r.stage {
                let from = r.stage;
                r.stage = stage;
                r.invalidate_after(stage, actor, now);
                r.bump_rollback(stage);
                events.push(StageEvent::RolledBack {
                    request_id: r.id.clone(),
                    from,
                    to: stage,
                });
            } else if r.stage.next() == Some(stage) {
                auto_advance(r, events);
            }
            Ok(())
        })
        .await
    }

    /// Remove a stage artifact. If the request already entered that stage it
    /// falls back to exactly the previous stage and everything downstream is
    /// marked stale.
    pub async fn delete_artifact(
        &self,
        request_id: &str,
        stage: Stage,
        actor: &str,
    ) -> Result<ManufacturingRequest> {
        self.mutate(request_id, |r, now, events| {
            let Some(previous) = stage.prev() else {
                return Err(invalid(r, "the request artifact cannot be deleted"));
            };
            if r.stage_files.remove(&stage).is_none() {
                return Err(invalid(r, format!("no {} artifact to delete", stage)));
            }
            r.set_review(stage, ReviewStatus::Pending, actor, None, now);

            if r.stage >= stage {
                let from = r.stage;
                r.stage = previous;
                r.invalidate_after(stage, actor, now);
                r.bump_rollback(stage);
                if stage == Stage::Machining {
                    r.bump_rollback(Stage::Cam);
                }
                if r.stage < Stage::Machining {
                    r.queued_job = None;
                }
                events.push(StageEvent::RolledBack {
                    request_id: r.id.clone(),
                    from,
                    to: previous,
                });
            } else if stage == Stage::Machining {
                r.queued_job = None;
            }
            Ok(())
        })
        .await
    }

    /// Set the review of the current stage. Approval advances when the next
    /// artifact is already in place. A rejected artifact must be replaced
    /// before its review can change again.
    pub async fn review(
        &self,
        request_id: &str,
        stage: Stage,
        status: ReviewStatus,
        actor: &str,
        reason: Option<String>,
    ) -> Result<ManufacturingRequest> {
        self.mutate(request_id, |r, now, events| {
            if stage.is_terminal() {
                return Err(invalid(r, "tracking has no review gate"));
            }
            if stage != r.stage {
                return Err(invalid(
                    r,
                    format!("only the {} review can change at stage {}", r.stage, r.stage),
                ));
            }
            if !r.artifact_ready(stage) {
                return Err(invalid(r, format!("no {} artifact to review", stage)));
            }
            if r.review(stage) == ReviewStatus::Rejected {
                return Err(invalid(
                    r,
                    format!("{} artifact was rejected and must be replaced", stage),
                ));
            }
            r.set_review(stage, status, actor, reason, now);
            if status == ReviewStatus::Approved {
                auto_advance(r, events);
            }
            Ok(())
        })
        .await
    }

    /// Record the final machining unit finishing on hardware. The completion
    /// record is the packing stage's artifact, so this advances once the
    /// machining review is approved. `program` is the artifact key the unit
    /// ran; a unit cut from a superseded program does not complete the stage.
    pub async fn record_machining_complete(
        &self,
        request_id: &str,
        job_ref: &JobRef,
        program: &str,
    ) -> Result<ManufacturingRequest> {
        self.mutate(request_id, |r, now, events| {
            if r.stage != Stage::Machining {
                return Err(invalid(
                    r,
                    format!("machining completion received at stage {}", r.stage),
                ));
            }
            let current = r
                .artifact(Stage::Machining)
                .filter(|a| !a.stale)
                .map(|a| a.key.as_str());
            if current != Some(program) {
                return Err(invalid(
                    r,
                    format!("program {} is not the current machining artifact", program),
                ));
            }
            r.stage_files.insert(
                Stage::Packing,
                Artifact::new(format!("machining-record/{}", job_ref), "bridge", now),
            );
            r.set_review(Stage::Packing, ReviewStatus::Pending, "bridge", None, now);
            auto_advance(r, events);
            Ok(())
        })
        .await
    }

    pub async fn assign_machine(
        &self,
        request_id: &str,
        machine_id: &str,
    ) -> Result<ManufacturingRequest> {
        self.mutate(request_id, |r, _, _| {
            r.assigned_machine = Some(machine_id.to_string());
            Ok(())
        })
        .await
    }

    /// Note that the current machining artifact has been put on a machine.
    pub async fn mark_queued(
        &self,
        request_id: &str,
        machine_id: &str,
        job_id: Uuid,
    ) -> Result<ManufacturingRequest> {
        self.mutate(request_id, |r, _, _| {
            if !r.machining_eligible() {
                return Err(invalid(r, "request is not waiting for machining"));
            }
            r.assigned_machine = Some(machine_id.to_string());
            r.queued_job = Some(job_id);
            Ok(())
        })
        .await
    }

    /// Finish a delivered request and archive it.
    pub async fn complete_tracking(
        &self,
        request_id: &str,
        actor: &str,
    ) -> Result<ManufacturingRequest> {
        self.mutate(request_id, |r, now, events| {
            if r.stage != Stage::Tracking {
                return Err(invalid(r, format!("cannot complete at stage {}", r.stage)));
            }
            if !r.artifact_ready(Stage::Tracking) {
                return Err(invalid(r, "tracking artifact is missing"));
            }
            r.archived = true;
            r.set_review(Stage::Tracking, ReviewStatus::Approved, actor, None, now);
            events.push(StageEvent::Archived {
                request_id: r.id.clone(),
                cancelled: false,
            });
            Ok(())
        })
        .await
    }

    /// Archive a request as cancelled. Queue cleanup is the caller's job.
    pub async fn cancel(
        &self,
        request_id: &str,
        actor: &str,
        reason: Option<String>,
    ) -> Result<ManufacturingRequest> {
        self.mutate(request_id, |r, now, events| {
            r.cancelled = true;
            r.archived = true;
            let stage = r.stage;
            if !stage.is_terminal() {
                r.set_review(stage, ReviewStatus::Rejected, actor, reason, now);
            }
            events.push(StageEvent::Archived {
                request_id: r.id.clone(),
                cancelled: true,
            });
            Ok(())
        })
        .await
    }
}
