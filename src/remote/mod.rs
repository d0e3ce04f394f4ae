//! Remote catalog access.

mod api_types;
#[cfg(test)]
mod fake;
mod github;

use std::future::Future;

use crate::error::Result;
use crate::model::Item;

#[cfg(test)]
pub(crate) use fake::FakeRemote;
pub use github::GitHubClient;

/// Fetches one page of items from the upstream catalog.
///
/// Requests carry no side effects, so repeating one is always safe. No
/// caching or retrying happens here.
pub trait RemoteSource: Send + Sync + 'static {
  /// Items on `page` (1-based) in upstream order, at most `page_size` of them.
  fn fetch_page(&self, page: u32, page_size: u32) -> impl Future<Output = Result<Vec<Item>>> + Send;
}
