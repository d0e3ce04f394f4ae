//! Catalog records and their cached form.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Visibility classification reported by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
  Public,
  Private,
  Internal,
}

impl Visibility {
  pub fn as_str(&self) -> &'static str {
    match self {
      Visibility::Public => "public",
      Visibility::Private => "private",
      Visibility::Internal => "internal",
    }
  }
}

impl fmt::Display for Visibility {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Visibility {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "public" => Ok(Visibility::Public),
      "private" => Ok(Visibility::Private),
      "internal" => Ok(Visibility::Internal),
      other => Err(format!("unknown visibility '{}'", other)),
    }
  }
}

/// One repository from the remote catalog.
///
/// Items are replaced wholesale on re-fetch and never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
  pub id: i64,
  pub name: String,
  pub full_name: String,
  pub description: Option<String>,
  pub owner_id: i64,
  pub owner_login: String,
  pub owner_avatar_url: String,
  pub is_private: bool,
  pub visibility: Visibility,
  pub url: String,
}

/// An item plus where it was fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub item: Item,
  /// Page number the item was fetched as part of (1-based)
  pub page: u32,
  /// Zero-based index within that page's fetch result
  pub position: u32,
  /// When the row was last written
  pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Tag a fetched page with its placement, preserving the remote order.
  pub fn tag_page(items: Vec<Item>, page: u32) -> Vec<CacheEntry> {
    let fetched_at = Utc::now();
    items
      .into_iter()
      .enumerate()
      .map(|(position, item)| CacheEntry {
        item,
        page,
        position: position as u32,
        fetched_at,
      })
      .collect()
  }

  /// Sort key reconstructing the remote sequence across pages.
  pub fn order_key(&self) -> (u32, u32) {
    (self.page, self.position)
  }
}

/// Aggregate view of what the cache currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheState {
  pub count: usize,
  /// Highest page number present, `None` when the cache is empty
  pub ceiling: Option<u32>,
}

#[cfg(test)]
pub(crate) fn test_item(id: i64, name: &str) -> Item {
  Item {
    id,
    name: name.to_string(),
    full_name: format!("octocat/{}", name),
    description: None,
    owner_id: 1,
    owner_login: "octocat".to_string(),
    owner_avatar_url: "https://avatars.githubusercontent.com/u/1".to_string(),
    is_private: false,
    visibility: Visibility::Public,
    url: format!("https://github.com/octocat/{}", name),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tag_page_preserves_remote_order() {
    let items = vec![test_item(30, "c"), test_item(10, "a"), test_item(20, "b")];
    let entries = CacheEntry::tag_page(items, 2);

    let placed: Vec<(i64, u32, u32)> = entries
      .iter()
      .map(|e| (e.item.id, e.page, e.position))
      .collect();
    assert_eq!(placed, vec![(30, 2, 0), (10, 2, 1), (20, 2, 2)]);
  }

  #[test]
  fn test_visibility_round_trips_through_text() {
    for v in [Visibility::Public, Visibility::Private, Visibility::Internal] {
      assert_eq!(v.as_str().parse::<Visibility>(), Ok(v));
    }
    assert!("secret".parse::<Visibility>().is_err());
  }
}
