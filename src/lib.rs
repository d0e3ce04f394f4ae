//! Offline-first browsing of a user's GitHub repositories.
//!
//! Pages fetched from GitHub land in a local SQLite cache; readers subscribe
//! to live snapshots of that cache and never wait on the network.

pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod pager;
pub mod remote;

pub use cache::{SqliteStorage, SyncCoordinator};
pub use error::{Error, Result};
pub use model::{CacheEntry, CacheState, Item, Visibility};
