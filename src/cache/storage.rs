//! Local store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{CacheEntry, CacheState, Item, Visibility};

/// What a committed write changed, as far as page-ceiling readers care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Touched {
  /// Lowest page whose contents changed; `None` when nothing changed
  pub lowest_page: Option<u32>,
}

impl Touched {
  pub fn nothing() -> Self {
    Self { lowest_page: None }
  }

  pub fn page(page: u32) -> Self {
    Self {
      lowest_page: Some(page),
    }
  }

  fn include(&mut self, page: u32) {
    self.lowest_page = Some(self.lowest_page.map_or(page, |p| p.min(page)));
  }

  fn merge(mut self, other: Touched) -> Self {
    if let Some(page) = other.lowest_page {
      self.include(page);
    }
    self
  }
}

/// Ordered, deduplicated persistence for cache entries.
///
/// Every write is atomic: a concurrent reader observes the state before or
/// after it, never part of it. Reads return entries ordered by
/// `(page, position)`.
pub trait LocalStore: Send + Sync {
  /// Insert or replace each entry by item id.
  fn upsert_batch(&self, entries: &[CacheEntry]) -> Result<Touched>;

  /// Clear the store and insert `entries` as one atomic unit.
  fn replace_all(&self, entries: &[CacheEntry]) -> Result<Touched>;

  /// All entries with `page <= max_page`.
  fn query_up_to(&self, max_page: u32) -> Result<Vec<CacheEntry>>;

  /// Ordered slice of the whole store.
  fn query_paged(&self, limit: usize, offset: usize) -> Result<Vec<CacheEntry>>;

  fn get_by_id(&self, id: i64) -> Result<Option<CacheEntry>>;

  fn clear_all(&self) -> Result<Touched>;

  fn clear_page(&self, page: u32) -> Result<Touched>;

  fn count(&self) -> Result<usize>;

  fn max_page(&self) -> Result<Option<u32>>;

  /// Count and ceiling, read together.
  fn state(&self) -> Result<CacheState>;
}

/// SQLite-backed store. One connection guarded by a mutex, so every read
/// runs against a fully committed state.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    debug!(path = %path.display(), "opened cache database");

    Self::with_connection(conn)
  }

  /// Open a private in-memory database. Contents live as long as the value.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Default database location under the user's data directory.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("repocat").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run cache migrations: {}", e)))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }

  fn select(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<CacheEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_entry)?;
    let mut entries = Vec::new();
    for row in rows {
      entries.push(row?);
    }
    Ok(entries)
  }
}

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    full_name TEXT NOT NULL,
    description TEXT,
    owner_id INTEGER NOT NULL,
    owner_login TEXT NOT NULL,
    owner_avatar_url TEXT NOT NULL,
    is_private INTEGER NOT NULL,
    visibility TEXT NOT NULL,
    url TEXT NOT NULL,
    page INTEGER NOT NULL,
    position_in_page INTEGER NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_order
    ON cache_entries(page, position_in_page);
"#;

const SELECT_COLUMNS: &str = "SELECT id, name, full_name, description, owner_id, owner_login, \
  owner_avatar_url, is_private, visibility, url, page, position_in_page, fetched_at \
  FROM cache_entries";

// `id` breaks ties left behind when a re-fetched page no longer lists an item.
const ORDER_BY: &str = "ORDER BY page ASC, position_in_page ASC, id ASC";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
  let fetched_at: String = row.get(12)?;
  Ok(CacheEntry {
    item: Item {
      id: row.get(0)?,
      name: row.get(1)?,
      full_name: row.get(2)?,
      description: row.get(3)?,
      owner_id: row.get(4)?,
      owner_login: row.get(5)?,
      owner_avatar_url: row.get(6)?,
      is_private: row.get(7)?,
      visibility: row.get(8)?,
      url: row.get(9)?,
    },
    page: row.get(10)?,
    position: row.get(11)?,
    fetched_at: parse_datetime(&fetched_at)
      .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, e.into()))?,
  })
}

/// Write entries inside an open transaction, noting every page they leave or enter.
fn write_entries(tx: &Transaction<'_>, entries: &[CacheEntry]) -> Result<Touched> {
  let mut touched = Touched::nothing();
  let mut previous_page = tx.prepare_cached("SELECT page FROM cache_entries WHERE id = ?")?;
  let mut insert = tx.prepare_cached(
    "INSERT OR REPLACE INTO cache_entries (id, name, full_name, description, owner_id, owner_login,
       owner_avatar_url, is_private, visibility, url, page, position_in_page, fetched_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
  )?;

  for entry in entries {
    let item = &entry.item;
    if let Some(page) = previous_page
      .query_row(params![item.id], |row| row.get::<_, u32>(0))
      .optional()?
    {
      touched.include(page);
    }
    touched.include(entry.page);

    insert.execute(params![
      item.id,
      item.name,
      item.full_name,
      item.description,
      item.owner_id,
      item.owner_login,
      item.owner_avatar_url,
      item.is_private,
      item.visibility,
      item.url,
      entry.page,
      entry.position,
      entry.fetched_at.to_rfc3339(),
    ])?;
  }

  Ok(touched)
}

fn lowest_page(conn: &Connection) -> Result<Option<u32>> {
  Ok(conn.query_row("SELECT MIN(page) FROM cache_entries", [], |row| row.get(0))?)
}

impl LocalStore for SqliteStorage {
  fn upsert_batch(&self, entries: &[CacheEntry]) -> Result<Touched> {
    if entries.is_empty() {
      return Ok(Touched::nothing());
    }

    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    let touched = write_entries(&tx, entries)?;
    tx.commit()?;

    debug!(count = entries.len(), "upserted batch");
    Ok(touched)
  }

  fn replace_all(&self, entries: &[CacheEntry]) -> Result<Touched> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    let cleared = match lowest_page(&tx)? {
      Some(page) => Touched::page(page),
      None => Touched::nothing(),
    };
    tx.execute("DELETE FROM cache_entries", [])?;
    let written = write_entries(&tx, entries)?;
    tx.commit()?;

    debug!(count = entries.len(), "replaced cache contents");
    Ok(cleared.merge(written))
  }

  fn query_up_to(&self, max_page: u32) -> Result<Vec<CacheEntry>> {
    let conn = self.conn()?;
    Self::select(
      &conn,
      &format!("{} WHERE page <= ? {}", SELECT_COLUMNS, ORDER_BY),
      params![max_page],
    )
  }

  fn query_paged(&self, limit: usize, offset: usize) -> Result<Vec<CacheEntry>> {
    let conn = self.conn()?;
    Self::select(
      &conn,
      &format!("{} {} LIMIT ? OFFSET ?", SELECT_COLUMNS, ORDER_BY),
      params![limit as i64, offset as i64],
    )
  }

  fn get_by_id(&self, id: i64) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;
    let entry = conn
      .query_row(
        &format!("{} WHERE id = ?", SELECT_COLUMNS),
        params![id],
        row_to_entry,
      )
      .optional()?;
    Ok(entry)
  }

  fn clear_all(&self) -> Result<Touched> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    let lowest = lowest_page(&tx)?;
    tx.execute("DELETE FROM cache_entries", [])?;
    tx.commit()?;

    Ok(Touched {
      lowest_page: lowest,
    })
  }

  fn clear_page(&self, page: u32) -> Result<Touched> {
    let conn = self.conn()?;
    let removed = conn.execute("DELETE FROM cache_entries WHERE page = ?", params![page])?;

    debug!(page, removed, "cleared page");
    Ok(if removed > 0 {
      Touched::page(page)
    } else {
      Touched::nothing()
    })
  }

  fn count(&self) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  fn max_page(&self) -> Result<Option<u32>> {
    let conn = self.conn()?;
    Ok(conn.query_row("SELECT MAX(page) FROM cache_entries", [], |row| row.get(0))?)
  }

  fn state(&self) -> Result<CacheState> {
    let conn = self.conn()?;
    let (count, ceiling): (i64, Option<u32>) = conn.query_row(
      "SELECT COUNT(*), MAX(page) FROM cache_entries",
      [],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(CacheState {
      count: count as usize,
      ceiling,
    })
  }
}

impl ToSql for Visibility {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    Ok(ToSqlOutput::from(self.as_str()))
  }
}

impl FromSql for Visibility {
  fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
    value
      .as_str()?
      .parse()
      .map_err(|e: String| FromSqlError::Other(e.into()))
  }
}

/// Parse a timestamp written by `upsert_batch`.
fn parse_datetime(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
  DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::test_item;

  fn page_of(page: u32, ids: std::ops::RangeInclusive<i64>) -> Vec<CacheEntry> {
    let items = ids.map(|id| test_item(id, &format!("repo-{}", id))).collect();
    CacheEntry::tag_page(items, page)
  }

  fn ids(entries: &[CacheEntry]) -> Vec<i64> {
    entries.iter().map(|e| e.item.id).collect()
  }

  #[test]
  fn test_upsert_same_id_keeps_latest_values() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store.upsert_batch(&page_of(1, 1..=3)).unwrap();

    let mut renamed = page_of(1, 2..=2);
    renamed[0].item.name = "renamed".to_string();
    renamed[0].position = 1;
    store.upsert_batch(&renamed).unwrap();

    assert_eq!(store.count().unwrap(), 3);
    let entry = store.get_by_id(2).unwrap().unwrap();
    assert_eq!(entry.item.name, "renamed");
    assert_eq!(entry.order_key(), (1, 1));
    assert_eq!(ids(&store.query_up_to(1).unwrap()), vec![1, 2, 3]);
  }

  #[test]
  fn test_ordering_ignores_insertion_order() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store.upsert_batch(&page_of(3, 21..=25)).unwrap();
    store.upsert_batch(&page_of(1, 1..=10)).unwrap();
    store.upsert_batch(&page_of(2, 11..=20)).unwrap();

    let all = store.query_up_to(3).unwrap();
    assert_eq!(ids(&all), (1..=25).collect::<Vec<_>>());
    assert!(all.windows(2).all(|w| w[0].order_key() < w[1].order_key()));

    assert_eq!(ids(&store.query_up_to(2).unwrap()), (1..=20).collect::<Vec<_>>());
  }

  #[test]
  fn test_refetched_id_moves_to_new_placement() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store.upsert_batch(&page_of(1, 1..=3)).unwrap();

    // Item 3 slid onto page 2 upstream
    let touched = store.upsert_batch(&page_of(2, 3..=4)).unwrap();
    assert_eq!(touched.lowest_page, Some(1));

    assert_eq!(ids(&store.query_up_to(1).unwrap()), vec![1, 2]);
    assert_eq!(ids(&store.query_up_to(2).unwrap()), vec![1, 2, 3, 4]);
    assert_eq!(store.count().unwrap(), 4);
  }

  #[test]
  fn test_query_paged_slices_in_order() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store.upsert_batch(&page_of(2, 11..=15)).unwrap();
    store.upsert_batch(&page_of(1, 1..=10)).unwrap();

    assert_eq!(ids(&store.query_paged(4, 8).unwrap()), vec![9, 10, 11, 12]);
    assert!(store.query_paged(10, 100).unwrap().is_empty());
  }

  #[test]
  fn test_clear_page_and_clear_all() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store.upsert_batch(&page_of(1, 1..=10)).unwrap();
    store.upsert_batch(&page_of(2, 11..=15)).unwrap();

    assert_eq!(store.clear_page(2).unwrap(), Touched::page(2));
    assert_eq!(
      store.state().unwrap(),
      CacheState {
        count: 10,
        ceiling: Some(1)
      }
    );
    assert_eq!(store.clear_page(7).unwrap(), Touched::nothing());

    assert_eq!(store.clear_all().unwrap(), Touched::page(1));
    assert_eq!(store.state().unwrap(), CacheState::default());
    assert_eq!(store.clear_all().unwrap(), Touched::nothing());
  }

  #[test]
  fn test_replace_all_swaps_contents() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store.upsert_batch(&page_of(1, 1..=10)).unwrap();
    store.upsert_batch(&page_of(2, 11..=15)).unwrap();

    let touched = store.replace_all(&page_of(1, 100..=102)).unwrap();
    assert_eq!(touched.lowest_page, Some(1));
    assert_eq!(ids(&store.query_up_to(5).unwrap()), vec![100, 101, 102]);
    assert_eq!(store.max_page().unwrap(), Some(1));
  }

  #[test]
  fn test_missing_id_is_none() {
    let store = SqliteStorage::open_in_memory().unwrap();
    assert!(store.get_by_id(42).unwrap().is_none());
    assert_eq!(store.max_page().unwrap(), None);
  }

  #[test]
  fn test_entries_survive_reopen() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("cache.db");

    {
      let store = SqliteStorage::open(&path).unwrap();
      let mut entries = page_of(1, 1..=2);
      entries[1].item.description = Some("hello".to_string());
      entries[1].item.visibility = Visibility::Internal;
      store.upsert_batch(&entries).unwrap();
    }

    let store = SqliteStorage::open(&path).unwrap();
    let entry = store.get_by_id(2).unwrap().unwrap();
    assert_eq!(entry.item.description.as_deref(), Some("hello"));
    assert_eq!(entry.item.visibility, Visibility::Internal);
    assert_eq!(store.count().unwrap(), 2);
  }

  #[test]
  fn test_reader_never_sees_a_partial_batch() {
    fn generation(g: usize) -> Vec<CacheEntry> {
      let items = (1..=20).map(|id| test_item(id, &format!("gen-{}", g))).collect();
      CacheEntry::tag_page(items, 1)
    }

    let store = std::sync::Arc::new(SqliteStorage::open_in_memory().unwrap());
    store.replace_all(&generation(0)).unwrap();

    let writer = std::thread::spawn({
      let store = std::sync::Arc::clone(&store);
      move || {
        for g in 1..=200 {
          if g % 2 == 0 {
            store.replace_all(&generation(g)).unwrap();
          } else {
            store.upsert_batch(&generation(g)).unwrap();
          }
        }
      }
    });

    let mut reads = 0;
    while !writer.is_finished() || reads == 0 {
      let entries = store.query_up_to(1).unwrap();
      assert_eq!(entries.len(), 20);
      let name = &entries[0].item.name;
      assert!(entries.iter().all(|e| &e.item.name == name), "mixed batches in one read");
      reads += 1;
    }
    writer.join().unwrap();

    let entries = store.query_up_to(1).unwrap();
    assert!(entries.iter().all(|e| e.item.name == "gen-200"));
  }
}
