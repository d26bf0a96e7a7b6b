use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{Bridge, JobRef};
use crate::error::{ConductorError, Result};
use crate::machine::MachineStatus;

/// Timeout-bounded handle on a [`Bridge`].
///
/// A call that exceeds `timeout` yields `BridgeTimeout`; the outcome on the
/// hardware side is unknown and must be resolved by a later status poll.
#[derive(Clone)]
pub struct BridgeClient {
    bridge: Arc<dyn Bridge>,
    timeout: Duration,
}

impl BridgeClient {
    pub fn new(bridge: Arc<dyn Bridge>, timeout: Duration) -> Self {
        Self { bridge, timeout }
    }

    async fn bounded<T>(
        &self,
        machine_id: &str,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(
                    machine_id,
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Bridge call timed out"
                );
                Err(ConductorError::BridgeTimeout {
                    machine_id: machine_id.to_string(),
                    operation,
                })
            }
        }
    }

    pub async fn upload(&self, machine_id: &str, program: &str) -> Result<JobRef> {
        self.bounded(machine_id, "upload", self.bridge.upload(machine_id, program))
            .await
    }

    pub async fn start(&self, machine_id: &str, job_ref: &JobRef) -> Result<()> {
        self.bounded(machine_id, "start", self.bridge.start(machine_id, job_ref))
            .await
    }

    pub async fn stop(&self, machine_id: &str) -> Result<()> {
        self.bounded(machine_id, "stop", self.bridge.stop(machine_id))
            .await
    }

    pub async fn reset(&self, machine_id: &str) -> Result<()> {
        self.bounded(machine_id, "reset", self.bridge.reset(machine_id))
            .await
    }

    pub async fn poll_status(&self, machine_id: &str) -> Result<MachineStatus> {
        let raw = self
            .bounded(machine_id, "poll_status", self.bridge.poll_status(machine_id))
            .await?;
        let status = MachineStatus::from_bridge(&raw);
        tracing::trace!(machine_id, raw = %raw, status = %status, "Polled machine status");
        Ok(status)
    }
}
