use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bridge::{Bridge, CompletionEvent, JobRef};
use crate::error::{ConductorError, Result};

#[derive(Debug, Default)]
struct SimMachine {
    status: &'static str,
    loaded: Option<JobRef>,
    running: Option<(JobRef, JoinHandle<()>)>,
}

type Machines = Arc<Mutex<HashMap<String, SimMachine>>>;

fn lock(machines: &Machines) -> MutexGuard<'_, HashMap<String, SimMachine>> {
    machines.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process stand-in for the hardware bridge, used for dry runs.
///
/// Every machine it is asked about exists and starts out `IDLE`. A started
/// program runs for a random time within `run_ms` and then reports its
/// completion on the channel the dispatch loop listens to.
pub struct SimulatedBridge {
    machines: Machines,
    completions: mpsc::Sender<CompletionEvent>,
    run_ms: (u64, u64),
    failure_rate: f64,
}

impl SimulatedBridge {
    pub fn new(completions: mpsc::Sender<CompletionEvent>, run_ms: (u64, u64)) -> Self {
        Self {
            machines: Arc::new(Mutex::new(HashMap::new())),
            completions,
            run_ms,
            failure_rate: 0.0,
        }
    }

    /// Fraction of runs that end in an alarm instead of a successful completion.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn rejected(machine_id: &str, reason: impl Into<String>) -> ConductorError {
        ConductorError::BridgeRejected {
            machine_id: machine_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Bridge for SimulatedBridge {
    async fn upload(&self, machine_id: &str, program: &str) -> Result<JobRef> {
        let mut machines = lock(&self.machines);
        let machine = machines.entry(machine_id.to_string()).or_default();
        if machine.running.is_some() {
            return Err(Self::rejected(machine_id, "machine busy"));
        }
        let job_ref = JobRef::new(format!("sim-{}", Uuid::new_v4()));
        machine.loaded = Some(job_ref.clone());
        tracing::debug!(machine_id, job_ref = %job_ref, program, "Simulated upload");
        Ok(job_ref)
    }

    async fn start(&self, machine_id: &str, job_ref: &JobRef) -> Result<()> {
        let (duration, fails) = {
            let mut rng = rand::thread_rng();
            let (min, max) = self.run_ms;
            (
                Duration::from_millis(rng.gen_range(min..=max)),
                rng.gen_bool(self.failure_rate),
            )
        };

        let mut machines = lock(&self.machines);
        let machine = machines.entry(machine_id.to_string()).or_default();
        if machine.running.is_some() || machine.status == "ALARM" {
            return Err(Self::rejected(machine_id, "machine not ready"));
        }
        if machine.loaded.as_ref() != Some(job_ref) {
            return Err(Self::rejected(machine_id, format!("{} is not loaded", job_ref)));
        }

        let state = self.machines.clone();
        let completions = self.completions.clone();
        let id = machine_id.to_string();
        let finished = job_ref.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let event = {
                let mut machines = lock(&state);
                let machine = machines.entry(id.clone()).or_default();
                machine.running = None;
                machine.loaded = None;
                if fails {
                    machine.status = "ALARM";
                    CompletionEvent::fail(&id, finished, "simulated alarm")
                } else {
                    machine.status = "IDLE";
                    CompletionEvent::success(&id, finished)
                }
            };
            if completions.send(event).await.is_err() {
                tracing::debug!(machine_id = %id, "Completion receiver dropped");
            }
        });

        machine.status = "RUN";
        machine.running = Some((job_ref.clone(), handle));
        tracing::debug!(
            machine_id,
            job_ref = %job_ref,
            duration_ms = duration.as_millis() as u64,
            "Simulated start"
        );
        Ok(())
    }

    async fn stop(&self, machine_id: &str) -> Result<()> {
        let stopped = {
            let mut machines = lock(&self.machines);
            let machine = machines.entry(machine_id.to_string()).or_default();
            machine.status = "IDLE";
            machine.loaded = None;
            machine.running.take().map(|(job_ref, handle)| {
                handle.abort();
                job_ref
            })
        };
        if let Some(job_ref) = stopped {
            let event = CompletionEvent::fail(machine_id, job_ref, "stopped by operator");
            if self.completions.send(event).await.is_err() {
                tracing::debug!(machine_id, "Completion receiver dropped");
            }
        }
        Ok(())
    }

    async fn reset(&self, machine_id: &str) -> Result<()> {
        let mut machines = lock(&self.machines);
        let machine = machines.entry(machine_id.to_string()).or_default();
        if machine.running.is_none() {
            machine.status = "IDLE";
        }
        Ok(())
    }

    async fn poll_status(&self, machine_id: &str) -> Result<String> {
        let machines = lock(&self.machines);
        let status = machines
            .get(machine_id)
            .map(|m| m.status)
            .filter(|s| !s.is_empty())
            .unwrap_or("IDLE");
        Ok(status.to_string())
    }
}
