//! Credential pool for rate-limited API clients
//!
//! Holds one client per configured identity and leases them to fetches one
//! at a time. Each client carries an independent rate-limit window per
//! endpoint category; `Pool::acquire` only hands out a client whose window
//! for the requested category still has quota, and otherwise waits for the
//! earliest reset (or for another lease to be released).
//!
//! Client lifecycle:
//! 1. Built at startup, starts `Idle` with unknown (= available) windows
//! 2. `acquire()` → `Leased`; responses fold their rate-limit headers into
//!    the window via `ClientLease::record`
//! 3. Rate-limit error → window exhausted until its reset
//! 4. Credential rejected → `Disabled` once the lease is dropped
//! 5. Lease dropped → back to `Idle`, waiters rescan
//! 6. Background sync refreshes windows from the live status endpoint

pub mod error;
pub mod pool;
pub mod quota;
pub mod sync;

pub use error::{Error, Result};
pub use pool::{ClientLease, ClientStatus, Pool, PoolConfig};
pub use quota::{classify, classify_status};
pub use sync::{spawn_sync_task, sync_cycle};
