//! Sync coordinator: the only writer between the remote source and the local store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::storage::{LocalStore, Touched};
use super::stream::{ChangeStream, Subscription};
use crate::error::{Error, Result};
use crate::model::{CacheEntry, CacheState, Item};
use crate::remote::RemoteSource;

/// Outcome of a successful page load or refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLoad {
  pub page: u32,
  /// Number of items the remote returned
  pub fetched: usize,
  /// A full page suggests more may follow; a short page means the end.
  pub has_more: bool,
}

impl PageLoad {
  fn new(page: u32, fetched: usize, page_size: u32) -> Self {
    Self {
      page,
      fetched,
      has_more: fetched >= page_size as usize,
    }
  }
}

/// Which operation a status report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
  LoadPage(u32),
  Refresh,
  EvictPage(u32),
}

/// Where a failed operation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedAt {
  /// Network or decode failure; nothing was written
  Fetching,
  /// Storage fault during commit
  Committing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
  #[default]
  Idle,
  Fetching,
  Committing,
  Done,
  Failed(FailedAt),
}

/// Phase of the most recently updated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatus {
  pub op: Option<SyncOp>,
  pub phase: SyncPhase,
}

type LoadSlot = watch::Sender<Option<Result<PageLoad>>>;

/// Page `n` holds different items at different page sizes.
type LoadKey = (u32, u32);

struct Inner<S, R> {
  store: Arc<S>,
  remote: R,
  stream: ChangeStream,
  /// Held for the whole commit-then-publish step
  write_gate: Mutex<()>,
  /// Page loads currently fetching, keyed by page and page size
  in_flight: Mutex<HashMap<LoadKey, Arc<LoadSlot>>>,
  status: watch::Sender<SyncStatus>,
}

/// Coordinates fetches and commits for the cache.
///
/// Consumers trigger work with `load_page`/`refresh` and read through
/// `observe_up_to`/`get_by_id`; they never reach the remote source directly.
pub struct SyncCoordinator<S, R> {
  inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for SyncCoordinator<S, R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: LocalStore + 'static, R: RemoteSource> SyncCoordinator<S, R> {
  pub fn new(store: S, remote: R) -> Self {
    let (status, _) = watch::channel(SyncStatus::default());
    Self {
      inner: Arc::new(Inner {
        store: Arc::new(store),
        remote,
        stream: ChangeStream::new(),
        write_gate: Mutex::new(()),
        in_flight: Mutex::new(HashMap::new()),
        status,
      }),
    }
  }

  /// Live ordered view of every cached item on pages `1..=max_page`.
  pub fn observe_up_to(&self, max_page: u32) -> Result<Subscription<S>> {
    self
      .inner
      .stream
      .subscribe(Arc::clone(&self.inner.store), max_page)
  }

  /// Fetch `page` and merge it into the cache.
  ///
  /// Concurrent calls for the same page share one fetch. On failure the
  /// cache is left as it was. Dropping the returned future detaches the
  /// caller; the fetch is abandoned without writing once nobody waits on it.
  pub async fn load_page(&self, page: u32, page_size: u32) -> Result<PageLoad> {
    validate(page, page_size)?;

    let mut rx = self.attach(page, page_size)?;
    let outcome = match rx.wait_for(Option::is_some).await {
      Ok(result) => (*result).clone(),
      Err(_) => None,
    };
    outcome.unwrap_or(Err(Error::Cancelled))
  }

  /// Re-fetch page 1 and replace the whole cache with it.
  ///
  /// The cache is only touched after the fetch succeeds, and the clear and
  /// insert commit together, so observers go straight from the old contents
  /// to the new ones.
  pub async fn refresh(&self, page_size: u32) -> Result<PageLoad> {
    validate(1, page_size)?;
    let op = SyncOp::Refresh;

    let guard = FetchGuard::start(&*self.inner, op);
    let fetched = self.inner.remote.fetch_page(1, page_size).await;
    guard.finish();

    let items = match fetched {
      Ok(items) => items,
      Err(e) => {
        self.inner.fetch_failed(op, &e);
        return Err(e);
      }
    };

    let fetched = items.len();
    let entries = CacheEntry::tag_page(items, 1);
    Arc::clone(&self.inner)
      .commit(op, move |store| store.replace_all(&entries))
      .await?;

    info!(fetched, "refreshed cache");
    Ok(PageLoad::new(1, fetched, page_size))
  }

  /// Cached item by id. A miss is `Ok(None)`, not an error.
  pub fn get_by_id(&self, id: i64) -> Result<Option<Item>> {
    Ok(self.inner.store.get_by_id(id)?.map(|entry| entry.item))
  }

  /// Ordered slice of the cache for consumers that don't need live updates.
  pub fn query_paged(&self, limit: usize, offset: usize) -> Result<Vec<Item>> {
    Ok(
      self
        .inner
        .store
        .query_paged(limit, offset)?
        .into_iter()
        .map(|entry| entry.item)
        .collect(),
    )
  }

  /// Drop every cached entry that was fetched as part of `page`.
  pub async fn evict_page(&self, page: u32) -> Result<()> {
    Arc::clone(&self.inner)
      .commit(SyncOp::EvictPage(page), move |store| store.clear_page(page))
      .await?;
    Ok(())
  }

  /// Entry count and highest cached page.
  pub fn cache_state(&self) -> Result<CacheState> {
    self.inner.store.state()
  }

  /// Phase reports for the most recent operation.
  pub fn status(&self) -> watch::Receiver<SyncStatus> {
    self.inner.status.subscribe()
  }

  /// Join the in-flight fetch for `page` at this size, or start one.
  ///
  /// A registered slot is joined even after its last caller left: the fetch
  /// task only abandons it under the same lock, after rechecking receivers.
  fn attach(&self, page: u32, page_size: u32) -> Result<watch::Receiver<Option<Result<PageLoad>>>> {
    let key = (page, page_size);
    let mut in_flight = self.inner.in_flight()?;

    if let Some(slot) = in_flight.get(&key) {
      debug!(page, page_size, "joining in-flight fetch");
      return Ok(slot.subscribe());
    }

    let (slot, rx) = watch::channel(None);
    let slot = Arc::new(slot);
    in_flight.insert(key, Arc::clone(&slot));
    drop(in_flight);

    tokio::spawn(Arc::clone(&self.inner).run_load(page, page_size, slot));
    Ok(rx)
  }
}

impl<S: LocalStore + 'static, R: RemoteSource> Inner<S, R> {
  async fn run_load(self: Arc<Self>, page: u32, page_size: u32, slot: Arc<LoadSlot>) {
    let op = SyncOp::LoadPage(page);
    self.set_phase(op, SyncPhase::Fetching);

    let fetch = self.remote.fetch_page(page, page_size);
    tokio::pin!(fetch);

    let fetched = loop {
      tokio::select! {
        fetched = &mut fetch => break fetched,
        _ = slot.closed() => {
          if self.abandon((page, page_size), &slot) {
            debug!(page, "fetch cancelled before commit, nothing written");
            self.set_phase(op, SyncPhase::Failed(FailedAt::Fetching));
            return;
          }
          // Someone attached while the last caller left; keep going for them.
        }
      }
    };

    let result = match fetched {
      Ok(items) => {
        let count = items.len();
        let entries = CacheEntry::tag_page(items, page);
        Arc::clone(&self)
          .commit(op, move |store| store.upsert_batch(&entries))
          .await
          .map(|_| {
            info!(page, fetched = count, "loaded page");
            PageLoad::new(page, count, page_size)
          })
      }
      Err(e) => {
        self.fetch_failed(op, &e);
        Err(e)
      }
    };

    self.release((page, page_size), &slot);
    slot.send_replace(Some(result));
  }

  /// Run one write through the single-writer gate and notify subscribers.
  ///
  /// The write runs on the blocking pool and finishes even if the awaiting
  /// caller goes away, so a commit is never left half done.
  async fn commit<F>(self: Arc<Self>, op: SyncOp, write: F) -> Result<Touched>
  where
    F: FnOnce(&S) -> Result<Touched> + Send + 'static,
  {
    self.set_phase(op, SyncPhase::Committing);

    let inner = Arc::clone(&self);
    let committed = tokio::task::spawn_blocking(move || -> Result<Touched> {
      let result = {
        let _gate = inner
          .write_gate
          .lock()
          .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
        write(inner.store.as_ref()).map(|touched| {
          inner.stream.publish(touched);
          touched
        })
      };

      match &result {
        Ok(_) => inner.set_phase(op, SyncPhase::Done),
        Err(e) => {
          error!(?op, error = %e, "commit failed, cached data may be lost");
          inner.set_phase(op, SyncPhase::Failed(FailedAt::Committing));
        }
      }
      result
    })
    .await;

    committed.unwrap_or_else(|e| Err(Error::Storage(format!("Commit task failed: {}", e))))
  }

  fn fetch_failed(&self, op: SyncOp, e: &Error) {
    warn!(?op, error = %e, retryable = e.is_retryable(), "fetch failed, cache left intact");
    self.set_phase(op, SyncPhase::Failed(FailedAt::Fetching));
  }

  fn in_flight(&self) -> Result<MutexGuard<'_, HashMap<LoadKey, Arc<LoadSlot>>>> {
    self
      .in_flight
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Unregister a finished load so later calls start a new fetch.
  fn release(&self, key: LoadKey, slot: &Arc<LoadSlot>) {
    if let Ok(mut in_flight) = self.in_flight() {
      if in_flight.get(&key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
        in_flight.remove(&key);
      }
    }
  }

  /// Unregister a load nobody waits on. Returns false if a caller attached
  /// in the meantime.
  fn abandon(&self, key: LoadKey, slot: &Arc<LoadSlot>) -> bool {
    let Ok(mut in_flight) = self.in_flight() else {
      return true;
    };
    if slot.receiver_count() > 0 {
      return false;
    }
    if in_flight.get(&key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
      in_flight.remove(&key);
    }
    true
  }
}

impl<S, R> Inner<S, R> {
  fn set_phase(&self, op: SyncOp, phase: SyncPhase) {
    debug!(?op, ?phase, "sync phase");
    self.status.send_replace(SyncStatus {
      op: Some(op),
      phase,
    });
  }
}

/// Reports `Fetching` for an operation and, if dropped before `finish`,
/// `Failed(Fetching)`: the caller went away and nothing was written.
struct FetchGuard<'a, S, R> {
  inner: &'a Inner<S, R>,
  op: SyncOp,
  done: bool,
}

impl<'a, S, R> FetchGuard<'a, S, R> {
  fn start(inner: &'a Inner<S, R>, op: SyncOp) -> Self {
    inner.set_phase(op, SyncPhase::Fetching);
    Self {
      inner,
      op,
      done: false,
    }
  }

  fn finish(mut self) {
    self.done = true;
  }
}

impl<S, R> Drop for FetchGuard<'_, S, R> {
  fn drop(&mut self) {
    if !self.done {
      debug!(op = ?self.op, "fetch dropped before it finished, nothing written");
      self
        .inner
        .set_phase(self.op, SyncPhase::Failed(FailedAt::Fetching));
    }
  }
}

fn validate(page: u32, page_size: u32) -> Result<()> {
  if page == 0 {
    return Err(Error::InvalidRequest("pages are numbered from 1".into()));
  }
  if page_size == 0 {
    return Err(Error::InvalidRequest("page size must be positive".into()));
  }
  Ok(())
}
