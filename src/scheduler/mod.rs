pub mod host;
pub mod jobs;

pub use host::{JobSchedulerHost, LoopStatus, PeriodicJob, SchedulerStatus};
pub use jobs::{
    CreditMatchingTick, InvoiceIssuingTick, LedgerCollaborator, NoopLedger, ProductionTick,
};
