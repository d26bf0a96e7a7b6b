use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::LeadershipConfig;
use crate::error::{ConductorError, Result};
use crate::store::LockStore;

/// Lifecycle of this process with respect to the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipState {
    /// Not holding the lease (yet)
    Candidate,
    Leader {
        since: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    /// Renewal failed; leader-only work must stop immediately
    Lost { reason: String },
    /// Lease handed back during shutdown
    Released,
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::Leader { .. })
    }
}

impl std::fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadershipState::Candidate => write!(f, "candidate"),
            LeadershipState::Leader { .. } => write!(f, "leader"),
            LeadershipState::Lost { .. } => write!(f, "lost"),
            LeadershipState::Released => write!(f, "released"),
        }
    }
}

enum RenewFailure {
    Taken,
    Store(String),
}

impl std::fmt::Display for RenewFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenewFailure::Taken => write!(f, "lease owned by another process"),
            RenewFailure::Store(e) => write!(f, "lock store error: {}", e),
        }
    }
}

/// Acquires, renews and releases one named lease on behalf of this process.
pub struct LeadershipManager {
    owner: String,
    config: LeadershipConfig,
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<LeadershipState>,
}

impl LeadershipManager {
    pub fn new(
        owner: impl Into<String>,
        config: LeadershipConfig,
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LeadershipState::Candidate);
        Self {
            owner: owner.into(),
            config,
            store,
            clock,
            state_tx,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn lock_name(&self) -> &str {
        &self.config.lock_name
    }

    /// Receive every leadership state change.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> LeadershipState {
        self.state_tx.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state_tx.borrow().is_leader()
    }

    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        now + ttl
    }

    fn lost(&self, reason: impl Into<String>) -> ConductorError {
        let reason = reason.into();
        self.state_tx.send_replace(LeadershipState::Lost {
            reason: reason.clone(),
        });
        ConductorError::LeadershipLost {
            name: self.config.lock_name.clone(),
            reason,
        }
    }

    /// Single acquisition attempt.
    ///
    /// An unreachable store counts as contention: leadership is only assumed
    /// after a confirmed write.
    pub async fn try_acquire(&self) -> Result<()> {
        let name = &self.config.lock_name;
        let now = self.clock.now();
        let expires_at = self.deadline(now);

        match self
            .store
            .try_acquire(name, &self.owner, now, expires_at)
            .await
        {
            Ok(true) => {
                self.state_tx.send_replace(LeadershipState::Leader {
                    since: now,
                    expires_at,
                });
                tracing::info!(lock = %name, owner = %self.owner, %expires_at, "Became leader");
                Ok(())
            }
            Ok(false) => {
                let holder = match self.store.get_lock(name).await {
                    Ok(row) => row.and_then(|r| r.owner),
                    Err(_) => None,
                };
                tracing::debug!(lock = %name, holder = ?holder, "Lease held elsewhere");
                Err(ConductorError::LockContention {
                    name: name.clone(),
                    holder,
                })
            }
            Err(e) => {
                tracing::warn!(lock = %name, error = %e, "Lock store unavailable during acquire");
                Err(ConductorError::LockContention {
                    name: name.clone(),
                    holder: None,
                })
            }
        }
    }

    async fn renew_lease(&self) -> std::result::Result<(), RenewFailure> {
        let name = &self.config.lock_name;
        let now = self.clock.now();
        let expires_at = self.deadline(now);

        match self.store.renew(name, &self.owner, expires_at).await {
            Ok(true) => {
                let since = match &*self.state_tx.borrow() {
                    LeadershipState::Leader { since, .. } => *since,
                    _ => now,
                };
                self.state_tx
                    .send_replace(LeadershipState::Leader { since, expires_at });
                tracing::trace!(lock = %name, %expires_at, "Lease renewed");
                Ok(())
            }
            Ok(false) => Err(RenewFailure::Taken),
            Err(e) => Err(RenewFailure::Store(e.to_string())),
        }
    }

    /// Extend the lease by one ttl. Any failure is reported as `LeadershipLost`;
    /// deciding whether it is final is up to [`hold`](Self::hold).
    pub async fn renew(&self) -> Result<()> {
        self.renew_lease()
            .await
            .map_err(|failure| ConductorError::LeadershipLost {
                name: self.config.lock_name.clone(),
                reason: failure.to_string(),
            })
    }

    /// Hand the lease back so a candidate can take over without waiting for expiry.
    pub async fn release(&self) -> Result<()> {
        let name = &self.config.lock_name;
        let released = self.store.release(name, &self.owner).await?;
        self.state_tx.send_replace(LeadershipState::Released);
        tracing::info!(lock = %name, owner = %self.owner, released, "Lease released");
        Ok(())
    }

    /// Block until this process holds the lease, retrying on a fixed interval.
    pub async fn wait_for_leadership(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(
            lock = %self.config.lock_name,
            owner = %self.owner,
            retry_ms = self.config.retry_interval.as_millis() as u64,
            "Waiting for leadership"
        );
        loop {
            match self.try_acquire().await {
                Ok(()) => return Ok(()),
                Err(ConductorError::LockContention { .. }) => {}
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConductorError::Shutdown),
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    /// Keep renewing until cancelled (lease released, `Ok`) or lost (`Err`).
    ///
    /// Losing ownership to another process is final at once. Store failures are
    /// tolerated up to `max_renew_failures` consecutive attempts, or until the
    /// lease this process last confirmed has expired, whichever comes first.
    pub async fn hold(&self, cancel: &CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = self.release().await {
                        tracing::warn!(error = %e, "Failed to release lease on shutdown");
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let failure = match self.renew_lease().await {
                Ok(()) => {
                    failures = 0;
                    continue;
                }
                Err(failure) => failure,
            };

            failures += 1;
            tracing::warn!(
                lock = %self.config.lock_name,
                failures,
                max = self.config.max_renew_failures,
                reason = %failure,
                "Lease renewal failed"
            );

            let expired = match &*self.state_tx.borrow() {
                LeadershipState::Leader { expires_at, .. } => self.clock.now() >= *expires_at,
                _ => true,
            };
            if matches!(failure, RenewFailure::Taken)
                || expired
                || failures >= self.config.max_renew_failures
            {
                tracing::error!(lock = %self.config.lock_name, reason = %failure, "Leadership lost");
                return Err(self.lost(failure.to_string()));
            }
        }
    }
}
