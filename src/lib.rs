pub mod bridge;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod leadership;
pub mod machine;
pub mod node;
pub mod queue;
pub mod scheduler;
pub mod shutdown;
pub mod stage;
pub mod store;
