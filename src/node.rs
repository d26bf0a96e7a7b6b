use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bridge::{Bridge, BridgeClient, CompletionEvent, MachiningLog, SimulatedBridge};
use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{ConductorError, Result};
use crate::leadership::LeadershipManager;
use crate::machine::{Machine, MachineRegistry};
use crate::queue::{Dispatcher, ProductionQueue, ProductionScheduler};
use crate::scheduler::{
    CreditMatchingTick, InvoiceIssuingTick, JobSchedulerHost, LedgerCollaborator, NoopLedger,
    ProductionTick,
};
use crate::stage::StageStateMachine;
use crate::store::{LockStore, MemoryStore, SqliteStore, StateStore};

const COMPLETION_BUFFER: usize = 256;

/// External collaborators of a worker process.
pub struct NodeParts {
    pub lock_store: Arc<dyn LockStore>,
    pub state_store: Arc<dyn StateStore>,
    pub bridge: Arc<dyn Bridge>,
    pub clock: Arc<dyn Clock>,
    pub ledger: Arc<dyn LedgerCollaborator>,
    /// Sender side of the channel the bridge reports completions on
    pub completions: mpsc::Sender<CompletionEvent>,
}

/// One worker process: a leadership candidate that, once elected, runs the
/// scheduler loops, the completion consumer and the stage-event follower.
pub struct Node {
    pub config: WorkerConfig,
    pub leadership: Arc<LeadershipManager>,
    pub machines: Arc<MachineRegistry>,
    pub queue: Arc<ProductionQueue>,
    pub stages: Arc<StageStateMachine>,
    pub records: Arc<MachiningLog>,
    pub dispatcher: Arc<Dispatcher>,
    pub production: Arc<ProductionScheduler>,
    pub host: Arc<JobSchedulerHost>,
    completions: mpsc::Sender<CompletionEvent>,
}

impl Node {
    /// Open the configured store and wire a node driving the simulated bridge.
    pub fn new(config: WorkerConfig) -> Result<(Self, mpsc::Receiver<CompletionEvent>)> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(COMPLETION_BUFFER);
        let bridge = Arc::new(SimulatedBridge::new(
            tx.clone(),
            config.bridge.simulated_run_ms,
        ));

        let (lock_store, state_store): (Arc<dyn LockStore>, Arc<dyn StateStore>) =
            match &config.database_path {
                Some(path) => {
                    let store = Arc::new(SqliteStore::open(path)?);
                    tracing::info!(path = %path.display(), "Using SQLite store");
                    (store.clone(), store)
                }
                None => {
                    tracing::warn!("No database configured, state is kept in memory only");
                    let store = Arc::new(MemoryStore::new());
                    (store.clone(), store)
                }
            };

        let parts = NodeParts {
            lock_store,
            state_store,
            bridge,
            clock: Arc::new(SystemClock),
            ledger: Arc::new(NoopLedger),
            completions: tx,
        };
        Ok((Self::with_parts(config, parts), rx))
    }

    pub fn with_parts(config: WorkerConfig, parts: NodeParts) -> Self {
        let NodeParts {
            lock_store,
            state_store,
            bridge,
            clock,
            ledger,
            completions,
        } = parts;

        let leadership = Arc::new(LeadershipManager::new(
            config.worker_id.clone(),
            config.leadership.clone(),
            lock_store,
            clock.clone(),
        ));
        let machines = Arc::new(MachineRegistry::new(state_store.clone(), clock.clone()));
        let queue = Arc::new(ProductionQueue::new(
            state_store.clone(),
            machines.clone(),
            clock.clone(),
            config.queue.max_jobs_per_machine,
        ));
        let stages = Arc::new(StageStateMachine::new(state_store.clone(), clock.clone()));
        let records = Arc::new(MachiningLog::new(state_store, clock.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            machines.clone(),
            queue.clone(),
            BridgeClient::new(bridge, config.bridge.call_timeout),
            records.clone(),
            stages.clone(),
        ));
        let production = Arc::new(ProductionScheduler::new(
            machines.clone(),
            queue.clone(),
            stages.clone(),
        ));

        let schedule = &config.schedule;
        let mut host = JobSchedulerHost::new(clock);
        host.register(Arc::new(ProductionTick::new(
            production.clone(),
            dispatcher.clone(),
            schedule.production_interval,
        )));
        host.register(Arc::new(CreditMatchingTick::new(
            ledger.clone(),
            schedule.credit_matching_interval,
        )));
        host.register(Arc::new(InvoiceIssuingTick::new(
            ledger,
            schedule.invoice_interval,
        )));

        Self {
            config,
            leadership,
            machines,
            queue,
            stages,
            records,
            dispatcher,
            production,
            host: Arc::new(host),
            completions,
        }
    }

    pub fn dashboard_state(&self) -> DashboardState {
        DashboardState {
            worker_id: self.config.worker_id.clone(),
            leadership: self.leadership.subscribe(),
            scheduler: self.host.status(),
            machines: self.machines.clone(),
            queue: self.queue.clone(),
            stages: self.stages.clone(),
            production: self.production.clone(),
            dispatcher: self.dispatcher.clone(),
            records: self.records.clone(),
            completions: self.completions.clone(),
            bridge_secret: self.config.bridge.shared_secret.clone(),
        }
    }

    /// Load authoritative state written by earlier leaders and prepare it for
    /// this term.
    async fn take_over(&self) -> Result<()> {
        let machines = self.machines.load().await?;
        let queues = self.queue.load().await?;
        let requests = self.stages.load().await?;
        self.records.load().await?;

        let mut provisioned = 0;
        for spec in &self.config.machines {
            let mut machine = Machine::new(&spec.id);
            if let Some(group) = &spec.diameter_group {
                machine = machine.with_material(group);
            }
            if self.machines.provision(machine).await? {
                provisioned += 1;
            }
        }

        let recovered = self.dispatcher.recover().await?;
        tracing::info!(
            machines,
            provisioned,
            queues,
            requests,
            recovered,
            "Took over leader duties"
        );
        Ok(())
    }

    /// Run the worker until shutdown or leadership loss.
    ///
    /// 1. Serves the dashboard (if configured) for the whole lifetime
    /// 2. Blocks until this process holds the lease
    /// 3. Loads state and starts the leader-only tasks
    /// 4. Renews the lease; on loss every leader-only task is cancelled and
    ///    `LeadershipLost` is returned, on shutdown the tasks are drained and
    ///    the lease released
    pub async fn run(
        self,
        completions: mpsc::Receiver<CompletionEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if let Some(addr) = self.config.dashboard_addr {
            let state = self.dashboard_state();
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                run_dashboard(addr, state, cancel).await;
            });
        }

        match self.leadership.wait_for_leadership(&shutdown).await {
            Ok(()) => {}
            Err(ConductorError::Shutdown) => return Ok(()),
            Err(e) => return Err(e),
        }

        if let Err(e) = self.take_over().await {
            tracing::error!(error = %e, "Failed to take over leader duties");
            if let Err(release_err) = self.leadership.release().await {
                tracing::warn!(error = %release_err, "Failed to release lease");
            }
            return Err(e);
        }

        let leader_work = shutdown.child_token();
        let mut tasks = JoinSet::new();

        let host = self.host.clone();
        let token = leader_work.clone();
        tasks.spawn(async move { host.run(token).await });

        tasks.spawn(
            self.dispatcher
                .clone()
                .run_completions(completions, leader_work.clone()),
        );

        tasks.spawn(
            self.production
                .clone()
                .run_events(self.stages.subscribe(), leader_work.clone()),
        );

        // The lease is released only after leader work has drained
        let keep_holding = CancellationToken::new();
        let outcome = tokio::select! {
            res = self.leadership.hold(&keep_holding) => res,
            _ = shutdown.cancelled() => Ok(()),
        };

        leader_work.cancel();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "Leader task terminated abnormally");
            }
        }

        match outcome {
            Ok(()) => {
                self.leadership.release().await?;
                tracing::info!("Leader duties stopped, lease released");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Leadership lost, leader-only work stopped");
                Err(e)
            }
        }
    }
}
