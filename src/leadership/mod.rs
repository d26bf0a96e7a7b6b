//! Leadership lease for singleton background duties.
//!
//! Exactly one worker process at a time may run the periodic schedulers. The
//! lease lives in a shared [`LockStore`](crate::store::LockStore) row and moves
//! between processes only through compare-and-set:
//!
//! - **Acquire**: `owner=self, expiresAt=now+ttl` where the row is free or expired
//! - **Renew**: same write, conditioned on `owner=self`, every heartbeat (< ttl)
//! - **Lose**: after `max_renew_failures` consecutive failed renewals the
//!   manager publishes [`LeadershipState::Lost`] and the process is expected to
//!   stop its leader-only loops and exit
//!
//! Business code never reads a shared flag; it subscribes to state changes via
//! [`LeadershipManager::subscribe`].

pub mod manager;

pub use manager::{LeadershipManager, LeadershipState};
