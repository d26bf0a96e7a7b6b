use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{ConductorError, Result};
use crate::store::{Collection, StateStore};

/// Bounded status domain for a CNC machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Idle,
    Running,
    Alarm,
    Error,
    /// A bridge call timed out; nothing may be started until a poll resolves it
    Unknown,
}

impl MachineStatus {
    /// Map the bridge's raw status code onto the status domain.
    ///
    /// This is the only place raw hardware strings are interpreted.
    pub fn from_bridge(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "IDLE" | "READY" | "STOP" | "STOPPED" | "COMPLETE" | "DONE" => MachineStatus::Idle,
            "RUN" | "RUNNING" | "START" | "BUSY" | "HOLD" => MachineStatus::Running,
            "ALARM" | "ALM" | "EMERGENCY" | "EMG" => MachineStatus::Alarm,
            "ERROR" | "ERR" | "FAULT" | "DISCONNECTED" | "OFFLINE" => MachineStatus::Error,
            _ => MachineStatus::Unknown,
        }
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineStatus::Idle => write!(f, "idle"),
            MachineStatus::Running => write!(f, "running"),
            MachineStatus::Alarm => write!(f, "alarm"),
            MachineStatus::Error => write!(f, "error"),
            MachineStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Raw stock currently loaded on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialState {
    /// Stock diameter class, e.g. "6", "8", "10", "12"
    pub diameter_group: String,
    pub loaded_at: DateTime<Utc>,
    pub loaded_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub status: MachineStatus,
    pub material: Option<MaterialState>,
    pub dummy_enabled: bool,
    pub allow_job_start: bool,
    pub status_updated_at: DateTime<Utc>,
}

impl Machine {
    /// A machine that has not reported yet. Timestamps are set when the
    /// registry accepts it.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: MachineStatus::Unknown,
            material: None,
            dummy_enabled: false,
            allow_job_start: true,
            status_updated_at: DateTime::<Utc>::default(),
        }
    }

    pub fn with_material(mut self, diameter_group: impl Into<String>) -> Self {
        self.material = Some(MaterialState {
            diameter_group: diameter_group.into(),
            loaded_at: DateTime::<Utc>::default(),
            loaded_by: "provisioning".to_string(),
        });
        self
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        self.status_updated_at = now;
        if let Some(material) = self.material.as_mut() {
            material.loaded_at = now;
        }
    }

    pub fn diameter_group(&self) -> Option<&str> {
        self.material.as_ref().map(|m| m.diameter_group.as_str())
    }

    /// Whether the dispatch loop may hand this machine a new job.
    pub fn can_start(&self) -> bool {
        self.status == MachineStatus::Idle && self.allow_job_start
    }
}

/// Persistent set of provisioned machines.
pub struct MachineRegistry {
    machines: Collection<Machine>,
    clock: Arc<dyn Clock>,
}

impl MachineRegistry {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            machines: Collection::new(store, "machine/"),
            clock,
        }
    }

    pub async fn load(&self) -> Result<usize> {
        self.machines.load_all().await
    }

    pub async fn register(&self, mut machine: Machine) -> Result<()> {
        machine.stamp(self.clock.now());
        let id = machine.id.clone();
        self.machines.insert(&id, machine).await?;
        tracing::info!(machine_id = %id, "Machine registered");
        Ok(())
    }

    /// Register `machine` unless the store already knows its id. Returns
    /// whether it was added.
    pub async fn provision(&self, mut machine: Machine) -> Result<bool> {
        if self.machines.contains(&machine.id).await {
            return Ok(false);
        }
        machine.stamp(self.clock.now());
        let id = machine.id.clone();
        match self.machines.insert(&id, machine).await {
            Ok(()) => {
                tracing::info!(machine_id = %id, "Machine provisioned");
                Ok(true)
            }
            Err(ConductorError::StoreConflict { .. }) => {
                self.machines.load_all().await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, machine_id: &str) -> Result<Machine> {
        self.machines
            .get(machine_id)
            .await
            .ok_or_else(|| ConductorError::MachineNotFound(machine_id.to_string()))
    }

    pub async fn ids(&self) -> Vec<String> {
        self.machines.ids().await
    }

    pub async fn list(&self) -> Vec<Machine> {
        self.machines.values().await
    }

    async fn update<R>(
        &self,
        machine_id: &str,
        f: impl FnOnce(&mut Machine) -> Result<R>,
    ) -> Result<R> {
        self.machines
            .update(machine_id, f)
            .await?
            .ok_or_else(|| ConductorError::MachineNotFound(machine_id.to_string()))
    }

    pub async fn set_status(&self, machine_id: &str, status: MachineStatus) -> Result<()> {
        let now = self.clock.now();
        let previous = self
            .update(machine_id, |m| {
                let previous = m.status;
                if previous != status {
                    m.status = status;
                    m.status_updated_at = now;
                }
                Ok(previous)
            })
            .await?;
        if previous != status {
            tracing::info!(machine_id, from = %previous, to = %status, "Machine status changed");
        }
        Ok(())
    }

    /// Operator material change. Refused while the machine is cutting.
    pub async fn set_material(
        &self,
        machine_id: &str,
        diameter_group: &str,
        operator: &str,
    ) -> Result<Machine> {
        let now = self.clock.now();
        self.update(machine_id, |m| {
            if m.status == MachineStatus::Running {
                return Err(ConductorError::MachineUnavailable {
                    machine_id: m.id.clone(),
                    status: m.status,
                });
            }
            m.material = Some(MaterialState {
                diameter_group: diameter_group.to_string(),
                loaded_at: now,
                loaded_by: operator.to_string(),
            });
            Ok(m.clone())
        })
        .await
    }

    pub async fn set_allow_job_start(&self, machine_id: &str, allow: bool) -> Result<()> {
        self.update(machine_id, |m| {
            m.allow_job_start = allow;
            Ok(())
        })
        .await
    }

    pub async fn set_dummy_enabled(&self, machine_id: &str, enabled: bool) -> Result<()> {
        self.update(machine_id, |m| {
            m.dummy_enabled = enabled;
            Ok(())
        })
        .await
    }
}
