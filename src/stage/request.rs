use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Manufacturing pipeline, in order. `Tracking` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Request,
    Cam,
    Machining,
    Packing,
    Shipping,
    Tracking,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Request,
        Stage::Cam,
        Stage::Machining,
        Stage::Packing,
        Stage::Shipping,
        Stage::Tracking,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn prev(self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ALL[i])
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Tracking
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Request => write!(f, "request"),
            Stage::Cam => write!(f, "cam"),
            Stage::Machining => write!(f, "machining"),
            Stage::Packing => write!(f, "packing"),
            Stage::Shipping => write!(f, "shipping"),
            Stage::Tracking => write!(f, "tracking"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.to_string() == s)
            .ok_or_else(|| format!("unknown stage: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewStatus::Pending => write!(f, "PENDING"),
            ReviewStatus::Approved => write!(f, "APPROVED"),
            ReviewStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub status: ReviewStatus,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub reason: Option<String>,
}

impl Review {
    pub fn pending(at: DateTime<Utc>, by: &str) -> Self {
        Self {
            status: ReviewStatus::Pending,
            updated_at: Some(at),
            updated_by: Some(by.to_string()),
            reason: None,
        }
    }
}

/// Reference to a stored file. Presence of this record is what "the
/// artifact exists" means.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub key: String,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: String,
    /// Set when an upstream artifact was removed; must be re-uploaded before use
    #[serde(default)]
    pub stale: bool,
}

impl Artifact {
    pub fn new(key: impl Into<String>, uploaded_by: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            uploaded_at: at,
            uploaded_by: uploaded_by.into(),
            stale: false,
        }
    }
}

/// One customer order moving through the manufacturing stages.
///
/// `stage_files[s]` is the artifact that admits the request into stage `s`,
/// and `review_by_stage[s]` is the reviewer's verdict on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManufacturingRequest {
    pub id: String,
    pub stage: Stage,
    pub review_by_stage: BTreeMap<Stage, Review>,
    pub stage_files: BTreeMap<Stage, Artifact>,
    pub assigned_machine: Option<String>,
    /// Stock diameter the parts are cut from
    pub diameter_group: Option<String>,
    pub quantity: u32,
    /// Queue job carrying the current machining artifact, once enqueued
    pub queued_job: Option<Uuid>,
    pub rollback_count: BTreeMap<Stage, u32>,
    pub archived: bool,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManufacturingRequest {
    pub fn review(&self, stage: Stage) -> ReviewStatus {
        self.review_by_stage
            .get(&stage)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn artifact(&self, stage: Stage) -> Option<&Artifact> {
        self.stage_files.get(&stage)
    }

    /// Artifact present and not invalidated by an upstream change.
    pub fn artifact_ready(&self, stage: Stage) -> bool {
        self.artifact(stage).is_some_and(|a| !a.stale)
    }

    /// Why the request cannot move to the next stage, if it cannot.
    pub fn advance_blocker(&self) -> Option<String> {
        let Some(next) = self.stage.next() else {
            return Some(format!("{} is the final stage", self.stage));
        };
        if !self.artifact_ready(next) {
            return Some(format!("{} artifact is missing or stale", next));
        }
        match self.review(self.stage) {
            ReviewStatus::Approved => None,
            status => Some(format!("{} review is {}", self.stage, status)),
        }
    }

    /// Whether the production scheduler should enqueue this request.
    pub fn machining_eligible(&self) -> bool {
        !self.archived
            && self.stage == Stage::Machining
            && self.queued_job.is_none()
            && self.artifact_ready(Stage::Machining)
            && self.artifact(Stage::Packing).is_none()
    }

    pub(crate) fn set_review(
        &mut self,
        stage: Stage,
        status: ReviewStatus,
        by: &str,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.review_by_stage.insert(
            stage,
            Review {
                status,
                updated_at: Some(at),
                updated_by: Some(by.to_string()),
                reason,
            },
        );
    }

    pub(crate) fn bump_rollback(&mut self, stage: Stage) {
        *self.rollback_count.entry(stage).or_insert(0) += 1;
    }

    /// Mark every artifact after `stage` stale and reset its review.
    pub(crate) fn invalidate_after(&mut self, stage: Stage, by: &str, at: DateTime<Utc>) {
        for later in Stage::ALL.iter().copied().filter(|s| *s > stage) {
            if let Some(artifact) = self.stage_files.get_mut(&later) {
                artifact.stale = true;
            }
            if self.review_by_stage.contains_key(&later) {
                self.set_review(later, ReviewStatus::Pending, by, None, at);
            }
        }
        if stage < Stage::Machining {
            self.queued_job = None;
        }
    }
}
