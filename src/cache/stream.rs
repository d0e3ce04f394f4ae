//! Live, ordered views over the local store.
//!
//! The writer publishes a commit mark after every committed mutation. Each
//! [`Subscription`] watches those marks and re-reads the store when a commit
//! touched a page at or below its ceiling. Publishing never waits on
//! subscribers: a slow subscriber skips straight to the latest state, and
//! because every emission is a fresh read it can never go backwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::watch;
use tracing::{trace, warn};

use super::storage::{LocalStore, Touched};
use crate::error::Result;
use crate::model::{CacheEntry, Item};

/// Commit history compressed to what ceiling checks need.
#[derive(Debug, Default)]
struct CommitLog {
  /// Sequence number of the latest commit
  seq: u64,
  /// Lowest page touched -> latest commit that touched it as its lowest page
  lowest_marks: BTreeMap<u32, u64>,
}

impl CommitLog {
  fn affects(&self, ceiling: u32, since: u64) -> bool {
    self
      .lowest_marks
      .range(..=ceiling)
      .any(|(_, &seq)| seq > since)
  }
}

/// Broadcasts commits to every live subscription.
pub struct ChangeStream {
  commits: watch::Sender<CommitLog>,
}

impl Default for ChangeStream {
  fn default() -> Self {
    Self::new()
  }
}

impl ChangeStream {
  pub fn new() -> Self {
    let (commits, _) = watch::channel(CommitLog::default());
    Self { commits }
  }

  /// Record a committed mutation. Must be called in commit order.
  pub fn publish(&self, touched: Touched) {
    let Some(page) = touched.lowest_page else {
      return;
    };

    self.commits.send_modify(|log| {
      log.seq += 1;
      log.lowest_marks.insert(page, log.seq);
    });
    trace!(page, "published commit");
  }

  /// Open a live view of every entry with `page <= ceiling`.
  ///
  /// The current snapshot is read before this returns, so the first
  /// `next()` always yields immediately.
  pub fn subscribe<S: LocalStore>(&self, store: Arc<S>, ceiling: u32) -> Result<Subscription<S>> {
    // Register before reading so no commit can slip between the two.
    let mut commits = self.commits.subscribe();
    let seen = commits.borrow_and_update().seq;
    let current = Snapshot::new(ceiling, store.query_up_to(ceiling)?);

    Ok(Subscription {
      store,
      ceiling,
      commits,
      seen,
      current,
      delivered: false,
    })
  }

  /// Number of live subscriptions.
  pub fn subscriber_count(&self) -> usize {
    self.commits.receiver_count()
  }
}

/// A consistent, ordered view of the store at one point in commit history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
  pub ceiling: u32,
  pub entries: Arc<Vec<CacheEntry>>,
}

impl Snapshot {
  fn new(ceiling: u32, entries: Vec<CacheEntry>) -> Self {
    Self {
      ceiling,
      entries: Arc::new(entries),
    }
  }

  pub fn items(&self) -> impl Iterator<Item = &Item> {
    self.entries.iter().map(|e| &e.item)
  }

  pub fn ids(&self) -> Vec<i64> {
    self.items().map(|item| item.id).collect()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// A live view of the store up to a page ceiling. Dropping it unsubscribes.
pub struct Subscription<S: LocalStore> {
  store: Arc<S>,
  ceiling: u32,
  commits: watch::Receiver<CommitLog>,
  seen: u64,
  current: Snapshot,
  delivered: bool,
}

impl<S: LocalStore> Subscription<S> {
  pub fn ceiling(&self) -> u32 {
    self.ceiling
  }

  /// The most recent snapshot this subscription produced.
  pub fn current(&self) -> &Snapshot {
    &self.current
  }

  /// Wait for the next snapshot.
  ///
  /// The first call returns the snapshot taken at subscription time. Later
  /// calls wait for a commit affecting this ceiling. Returns `None` once the
  /// writer side is gone.
  pub async fn next(&mut self) -> Option<Snapshot> {
    if !self.delivered {
      self.delivered = true;
      return Some(self.current.clone());
    }

    loop {
      self.commits.changed().await.ok()?;

      let relevant = {
        let log = self.commits.borrow_and_update();
        let relevant = log.affects(self.ceiling, self.seen);
        self.seen = log.seq;
        relevant
      };
      if !relevant {
        continue;
      }

      match self.store.query_up_to(self.ceiling) {
        // A read can land after a later commit too; skip it if that commit
        // was already reflected.
        Ok(entries) if entries == *self.current.entries => continue,
        Ok(entries) => {
          self.current = Snapshot::new(self.ceiling, entries);
          return Some(self.current.clone());
        }
        Err(e) => {
          warn!(ceiling = self.ceiling, error = %e, "failed to read snapshot, keeping previous");
        }
      }
    }
  }

  /// Adapt into a `Stream` of snapshots.
  pub fn into_stream(self) -> impl Stream<Item = Snapshot>
  where
    S: 'static,
  {
    futures::stream::unfold(self, |mut sub| async move {
      let snapshot = sub.next().await?;
      Some((snapshot, sub))
    })
  }

  /// Stop receiving snapshots.
  pub fn unsubscribe(self) {}
}
