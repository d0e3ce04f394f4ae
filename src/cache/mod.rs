//! Offline-first cache for paged repository listings.
//!
//! - `storage`: ordered, deduplicated SQLite persistence keyed by item id
//! - `stream`: live snapshots pushed to subscribers after each commit
//! - `layer`: the sync coordinator, sole writer, fetching through a `RemoteSource`
//!
//! Cached data stays readable when the network is not.

mod layer;
mod storage;
mod stream;

pub use layer::{FailedAt, PageLoad, SyncCoordinator, SyncOp, SyncPhase, SyncStatus};
pub use storage::{LocalStore, SqliteStorage, Touched};
pub use stream::{ChangeStream, Snapshot, Subscription};
