//! Manufacturing stages and their review gates.
//!
//! `request → cam → machining → packing → shipping → tracking`
//!
//! A request enters stage `k+1` only when the artifact for `k+1` is present
//! and the review of stage `k` is approved. Removing an artifact the request
//! has already passed moves it back to the stage just before it.

pub mod request;
pub mod state_machine;

pub use request::{Artifact, ManufacturingRequest, Review, ReviewStatus, Stage};
pub use state_machine::{NewRequest, StageEvent, StageStateMachine};
