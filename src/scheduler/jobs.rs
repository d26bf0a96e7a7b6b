use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::queue::{Dispatcher, ProductionScheduler};
use crate::scheduler::host::PeriodicJob;

/// Billing side of the worker. Accounting rules live outside this crate; the
/// scheduler only decides when they run.
#[async_trait]
pub trait LedgerCollaborator: Send + Sync {
    /// Match incoming payments against open credit. Returns matched entries.
    async fn match_credits(&self) -> Result<usize>;

    /// Issue invoices that are due. Returns issued invoices.
    async fn issue_invoices(&self) -> Result<usize>;
}

/// Ledger that has nothing to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLedger;

#[async_trait]
impl LedgerCollaborator for NoopLedger {
    async fn match_credits(&self) -> Result<usize> {
        tracing::debug!("No ledger configured, credit matching skipped");
        Ok(0)
    }

    async fn issue_invoices(&self) -> Result<usize> {
        tracing::debug!("No ledger configured, invoice issuing skipped");
        Ok(0)
    }
}

/// Feed machining-ready requests into queues, then run one dispatch pass.
pub struct ProductionTick {
    production: Arc<ProductionScheduler>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl ProductionTick {
    pub fn new(
        production: Arc<ProductionScheduler>,
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
    ) -> Self {
        Self {
            production,
            dispatcher,
            interval,
        }
    }
}

#[async_trait]
impl PeriodicJob for ProductionTick {
    fn name(&self) -> &'static str {
        "production-scheduler"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let fed = self.production.feed().await?;
        let started = self.dispatcher.tick().await?;
        tracing::debug!(fed, started, "Production tick");
        Ok(())
    }
}

pub struct CreditMatchingTick {
    ledger: Arc<dyn LedgerCollaborator>,
    interval: Duration,
}

impl CreditMatchingTick {
    pub fn new(ledger: Arc<dyn LedgerCollaborator>, interval: Duration) -> Self {
        Self { ledger, interval }
    }
}

#[async_trait]
impl PeriodicJob for CreditMatchingTick {
    fn name(&self) -> &'static str {
        "credit-matching"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let matched = self.ledger.match_credits().await?;
        if matched > 0 {
            tracing::info!(matched, "Credits matched");
        }
        Ok(())
    }
}

pub struct InvoiceIssuingTick {
    ledger: Arc<dyn LedgerCollaborator>,
    interval: Duration,
}

impl InvoiceIssuingTick {
    pub fn new(ledger: Arc<dyn LedgerCollaborator>, interval: Duration) -> Self {
        Self { ledger, interval }
    }
}

#[async_trait]
impl PeriodicJob for InvoiceIssuingTick {
    fn name(&self) -> &'static str {
        "invoice-issuing"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let issued = self.ledger.issue_invoices().await?;
        if issued > 0 {
            tracing::info!(issued, "Invoices issued");
        }
        Ok(())
    }
}
