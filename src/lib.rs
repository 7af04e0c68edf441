//! UrBackup server engine: orchestrates the `ub-*` component crates
//! behind the client session state machine (C7) and the per-client
//! download scheduler (C8).
//!
//! Lock order, which nothing in this tree may invert:
//! `ClientMain -> Scheduler -> CAS -> Index -> Snapshot -> CBT`.

pub mod backoff;
pub mod ping;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod worker;
