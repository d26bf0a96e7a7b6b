use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConductorError, Result};

/// Settings for the leadership lease.
///
/// The heartbeat must fire strictly more often than the lease expires, otherwise a
/// healthy leader would lose its lease between renewals.
#[derive(Debug, Clone)]
pub struct LeadershipConfig {
    /// Name of the lock row shared by all worker processes
    pub lock_name: String,
    /// How long a granted or renewed lease stays valid
    pub ttl: Duration,
    /// How often the leader renews its lease
    pub heartbeat_interval: Duration,
    /// How often a candidate retries acquisition
    pub retry_interval: Duration,
    /// Consecutive failed renewals before leadership is considered lost
    pub max_renew_failures: u32,
}

impl Default for LeadershipConfig {
    fn default() -> Self {
        Self {
            lock_name: "bg-worker".to_string(),
            ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            retry_interval: Duration::from_secs(5),
            max_renew_failures: 3,
        }
    }
}

/// Settings for calls into the machine bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound for every bridge call
    pub call_timeout: Duration,
    /// Shared secret expected in the `X-Bridge-Secret` header of callbacks.
    /// When unset, callbacks are accepted without a secret.
    pub shared_secret: Option<String>,
    /// Bounds of the simulated machining time, in milliseconds
    pub simulated_run_ms: (u64, u64),
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            shared_secret: None,
            simulated_run_ms: (2_000, 6_000),
        }
    }
}

/// Intervals of the leader-only periodic loops.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub production_interval: Duration,
    pub credit_matching_interval: Duration,
    pub invoice_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            production_interval: Duration::from_secs(5),
            credit_matching_interval: Duration::from_secs(60),
            invoice_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_jobs_per_machine: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_machine: 500,
        }
    }
}

/// A machine registered at startup if the store does not know it yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub id: String,
    pub diameter_group: Option<String>,
}

impl std::str::FromStr for MachineSpec {
    type Err = String;

    /// `M1` or `M1:8` (machine id, optional loaded diameter group)
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(2, ':');
        let id = parts.next().unwrap_or_default().trim();
        if id.is_empty() {
            return Err(format!("invalid machine spec: {:?}", s));
        }
        let diameter_group = parts
            .next()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string);
        Ok(Self {
            id: id.to_string(),
            diameter_group,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Opaque owner id written into the lock row
    pub worker_id: String,
    /// SQLite database shared with peer workers. In-memory when unset.
    pub database_path: Option<PathBuf>,
    pub dashboard_addr: Option<SocketAddr>,
    pub leadership: LeadershipConfig,
    pub bridge: BridgeConfig,
    pub schedule: ScheduleConfig,
    pub queue: QueueConfig,
    pub machines: Vec<MachineSpec>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            database_path: None,
            dashboard_addr: None,
            leadership: LeadershipConfig::default(),
            bridge: BridgeConfig::default(),
            schedule: ScheduleConfig::default(),
            queue: QueueConfig::default(),
            machines: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_database(mut self, path: PathBuf) -> Self {
        self.database_path = Some(path);
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_leadership(mut self, leadership: LeadershipConfig) -> Self {
        self.leadership = leadership;
        self
    }

    pub fn with_machines(mut self, machines: Vec<MachineSpec>) -> Self {
        self.machines = machines;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let lease = &self.leadership;
        if self.worker_id.trim().is_empty() {
            return Err(ConductorError::Config("worker id must not be empty".into()));
        }
        if lease.ttl.is_zero() || lease.heartbeat_interval.is_zero() {
            return Err(ConductorError::Config(
                "lease ttl and heartbeat interval must be non-zero".into(),
            ));
        }
        if lease.heartbeat_interval >= lease.ttl {
            return Err(ConductorError::Config(format!(
                "heartbeat interval {:?} must be shorter than lease ttl {:?}",
                lease.heartbeat_interval, lease.ttl
            )));
        }
        if lease.retry_interval.is_zero() {
            return Err(ConductorError::Config(
                "retry interval must be non-zero".into(),
            ));
        }
        if lease.max_renew_failures == 0 {
            return Err(ConductorError::Config(
                "max renew failures must be at least 1".into(),
            ));
        }
        let schedule = &self.schedule;
        if schedule.production_interval.is_zero()
            || schedule.credit_matching_interval.is_zero()
            || schedule.invoice_interval.is_zero()
        {
            return Err(ConductorError::Config(
                "scheduler intervals must be non-zero".into(),
            ));
        }
        let (min_ms, max_ms) = self.bridge.simulated_run_ms;
        if min_ms > max_ms {
            return Err(ConductorError::Config(
                "simulated run range is inverted".into(),
            ));
        }
        Ok(())
    }
}
