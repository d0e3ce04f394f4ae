//! Scripted in-process remote for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use super::RemoteSource;
use crate::error::{Error, Result};
use crate::model::{test_item, Item};

/// Pages without a scripted response come back empty.
#[derive(Clone, Default)]
pub(crate) struct FakeRemote {
  responses: Arc<Mutex<HashMap<u32, Result<Vec<Item>>>>>,
  calls: Arc<AtomicUsize>,
  gate: Option<Arc<Semaphore>>,
}

impl FakeRemote {
  /// Every fetch waits for a permit from the returned semaphore.
  pub(crate) fn gated() -> (Self, Arc<Semaphore>) {
    let gate = Arc::new(Semaphore::new(0));
    let remote = Self {
      gate: Some(Arc::clone(&gate)),
      ..Self::default()
    };
    (remote, gate)
  }

  pub(crate) fn respond(&self, page: u32, ids: std::ops::RangeInclusive<i64>) {
    let items = ids.map(|id| test_item(id, &format!("repo-{}", id))).collect();
    self.respond_with(page, Ok(items));
  }

  pub(crate) fn respond_with(&self, page: u32, response: Result<Vec<Item>>) {
    self.responses.lock().unwrap().insert(page, response);
  }

  pub(crate) fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl RemoteSource for FakeRemote {
  async fn fetch_page(&self, page: u32, _page_size: u32) -> Result<Vec<Item>> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(gate) = &self.gate {
      gate
        .acquire()
        .await
        .map_err(|_| Error::Network("gate closed".into()))?
        .forget();
    }
    let response = self.responses.lock().unwrap().get(&page).cloned();
    response.unwrap_or_else(|| Ok(Vec::new()))
  }
}
