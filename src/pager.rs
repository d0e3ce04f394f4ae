//! Paging state for the repository list.
//!
//! Tracks how far the list has been loaded and keeps a live view open at
//! that ceiling. Loading the next page only moves the ceiling once the page
//! has committed, so a failed load never hides data already on screen.

use tracing::debug;

use crate::cache::{LocalStore, PageLoad, Subscription, SyncCoordinator};
use crate::error::{Error, Result};
use crate::remote::RemoteSource;

/// Snapshot of the pager's bookkeeping, for status lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagerState {
  /// Highest page included in the view (0 before anything is loaded)
  pub ceiling: u32,
  pub has_more: bool,
  pub last_error: Option<Error>,
}

pub struct Pager<S: LocalStore, R> {
  sync: SyncCoordinator<S, R>,
  page_size: u32,
  ceiling: u32,
  has_more: bool,
  last_error: Option<Error>,
  view: Subscription<S>,
}

impl<S: LocalStore + 'static, R: RemoteSource> Pager<S, R> {
  /// Start from whatever is already cached, so an offline cold start still
  /// shows every stored page.
  pub fn new(sync: SyncCoordinator<S, R>, page_size: u32) -> Result<Self> {
    let ceiling = sync.cache_state()?.ceiling.unwrap_or(0);
    let view = sync.observe_up_to(ceiling)?;
    debug!(ceiling, page_size, "pager resumed from cache");

    Ok(Self {
      sync,
      page_size,
      ceiling,
      has_more: true,
      last_error: None,
      view,
    })
  }

  pub fn state(&self) -> PagerState {
    PagerState {
      ceiling: self.ceiling,
      has_more: self.has_more,
      last_error: self.last_error.clone(),
    }
  }

  /// Live view of every loaded page. Replaced whenever the ceiling moves.
  pub fn view(&mut self) -> &mut Subscription<S> {
    &mut self.view
  }

  /// Load the page after the current ceiling.
  ///
  /// Returns `Ok(None)` without fetching once a short page marked the end.
  pub async fn load_next(&mut self) -> Result<Option<PageLoad>> {
    if !self.has_more {
      return Ok(None);
    }

    let page = self.ceiling + 1;
    let result = self.sync.load_page(page, self.page_size).await;
    let load = self.track(result)?;

    self.has_more = load.has_more;
    if load.fetched > 0 {
      self.move_ceiling(page)?;
    }
    Ok(Some(load))
  }

  /// Replace the cache with a fresh first page.
  ///
  /// The view is always reopened, so `view().current()` holds the refreshed
  /// contents even when the ceiling was already 1.
  pub async fn refresh(&mut self) -> Result<PageLoad> {
    let result = self.sync.refresh(self.page_size).await;
    let load = self.track(result)?;

    self.has_more = load.has_more;
    self.resubscribe(1)?;
    Ok(load)
  }

  fn track(&mut self, result: Result<PageLoad>) -> Result<PageLoad> {
    match result {
      Ok(load) => {
        self.last_error = None;
        Ok(load)
      }
      Err(e) => {
        self.last_error = Some(e.clone());
        Err(e)
      }
    }
  }

  fn move_ceiling(&mut self, ceiling: u32) -> Result<()> {
    if ceiling != self.ceiling {
      self.resubscribe(ceiling)?;
    }
    Ok(())
  }

  fn resubscribe(&mut self, ceiling: u32) -> Result<()> {
    self.view = self.sync.observe_up_to(ceiling)?;
    self.ceiling = ceiling;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::remote::FakeRemote;

  fn pager(remote: &FakeRemote) -> Pager<SqliteStorage, FakeRemote> {
    let sync = SyncCoordinator::new(SqliteStorage::open_in_memory().unwrap(), remote.clone());
    Pager::new(sync, 10).unwrap()
  }

  #[tokio::test]
  async fn test_loads_until_short_page() {
    let remote = FakeRemote::default();
    remote.respond(1, 1..=10);
    remote.respond(2, 11..=15);
    let mut pager = pager(&remote);
    assert!(pager.view().next().await.unwrap().is_empty());

    pager.load_next().await.unwrap().unwrap();
    assert_eq!(pager.state().ceiling, 1);
    assert_eq!(pager.view().next().await.unwrap().len(), 10);

    let last = pager.load_next().await.unwrap().unwrap();
    assert!(!last.has_more);
    assert_eq!(pager.view().next().await.unwrap().ids(), (1..=15).collect::<Vec<_>>());

    assert_eq!(pager.load_next().await.unwrap(), None);
    assert_eq!(remote.calls(), 2);
  }

  #[tokio::test]
  async fn test_failed_load_keeps_ceiling_and_records_error() {
    let remote = FakeRemote::default();
    remote.respond(1, 1..=10);
    remote.respond_with(2, Err(Error::Network("offline".into())));
    let mut pager = pager(&remote);

    pager.load_next().await.unwrap();
    assert!(pager.load_next().await.is_err());

    let state = pager.state();
    assert_eq!(state.ceiling, 1);
    assert!(state.has_more);
    assert_eq!(state.last_error, Some(Error::Network("offline".into())));
    assert_eq!(pager.view().current().len(), 10);

    // Retry succeeds and clears the error
    remote.respond(2, 11..=12);
    pager.load_next().await.unwrap();
    assert_eq!(pager.state().last_error, None);
    assert_eq!(pager.state().ceiling, 2);
  }

  #[tokio::test]
  async fn test_empty_page_does_not_move_ceiling() {
    let remote = FakeRemote::default();
    remote.respond(1, 1..=10);
    let mut pager = pager(&remote);

    pager.load_next().await.unwrap();
    let empty = pager.load_next().await.unwrap().unwrap();
    assert_eq!(empty.fetched, 0);
    assert!(!empty.has_more);
    assert_eq!(pager.state().ceiling, 1);
  }

  #[tokio::test]
  async fn test_refresh_resets_to_first_page() {
    let remote = FakeRemote::default();
    remote.respond(1, 1..=10);
    remote.respond(2, 11..=20);
    let mut pager = pager(&remote);
    pager.load_next().await.unwrap();
    pager.load_next().await.unwrap();

    remote.respond(1, 50..=59);
    let load = pager.refresh().await.unwrap();
    assert!(load.has_more);

    assert_eq!(pager.state().ceiling, 1);
    assert_eq!(pager.view().next().await.unwrap().ids(), (50..=59).collect::<Vec<_>>());
  }

  #[tokio::test]
  async fn test_resumes_from_cached_ceiling() {
    let remote = FakeRemote::default();
    remote.respond(1, 1..=10);
    remote.respond(2, 11..=20);
    let sync = SyncCoordinator::new(SqliteStorage::open_in_memory().unwrap(), remote.clone());
    sync.load_page(1, 10).await.unwrap();
    sync.load_page(2, 10).await.unwrap();

    let mut pager = Pager::new(sync, 10).unwrap();
    assert_eq!(pager.state().ceiling, 2);
    assert_eq!(pager.view().next().await.unwrap().len(), 20);
  }

  #[tokio::test]
  async fn test_refresh_at_first_page_shows_new_contents() {
    let remote = FakeRemote::default();
    remote.respond(1, 1..=10);
    let sync = SyncCoordinator::new(SqliteStorage::open_in_memory().unwrap(), remote.clone());
    sync.load_page(1, 10).await.unwrap();

    let mut pager = Pager::new(sync, 10).unwrap();
    assert_eq!(pager.state().ceiling, 1);

    remote.respond(1, 50..=59);
    pager.refresh().await.unwrap();

    assert_eq!(pager.view().current().ids(), (50..=59).collect::<Vec<_>>());
    assert_eq!(pager.view().next().await.unwrap().ids(), (50..=59).collect::<Vec<_>>());
  }
}
