//! SQLite storage backend shared by several processes.
//!
//! Values live in `kv_store`. Every write also appends to `kv_changes`; each
//! backend polls that log and republishes rows written by other backends on
//! its own change feed, which is how a second process learns about a save.

use color_eyre::{eyre::eyre, Result};
use futures::FutureExt;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ChangeEvent, StorageBackend, StorageFuture, CHANGE_FEED_CAPACITY};
use crate::error::StorageError;

/// Default interval between change-log polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Schema for the key-value tables.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Change log read by other processes
CREATE TABLE IF NOT EXISTS kv_changes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    origin TEXT NOT NULL,
    changed_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-based durable store.
pub struct SqliteBackend {
  conn: Arc<Mutex<Connection>>,
  /// Identifies this backend's rows in the change log
  origin: String,
  changes: broadcast::Sender<ChangeEvent>,
  poller: JoinHandle<()>,
}

impl SqliteBackend {
  /// Open the store at the default location.
  ///
  /// Must be called inside a tokio runtime; the change-log poller is spawned here.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?, DEFAULT_POLL_INTERVAL)
  }

  /// Open the store at `path`, polling for foreign changes every `poll_interval`.
  pub fn open_at(path: &Path, poll_interval: Duration) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to configure store: {}", e))?;
    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    // Only changes made after opening are interesting
    let last_seq: i64 = conn
      .query_row("SELECT COALESCE(MAX(seq), 0) FROM kv_changes", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to read change log: {}", e))?;

    let origin = format!(
      "{}:{}",
      std::process::id(),
      NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
    );
    let conn = Arc::new(Mutex::new(conn));
    let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

    let poller = tokio::spawn(poll_changes(
      Arc::clone(&conn),
      origin.clone(),
      changes.clone(),
      last_seq,
      poll_interval,
    ));

    debug!(path = %path.display(), %origin, "opened sqlite store");

    Ok(Self {
      conn,
      origin,
      changes,
      poller,
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("redmine-tt").join("state.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("Lock poisoned: {}", e)))
  }

  fn publish(&self, events: Vec<ChangeEvent>) {
    for event in events {
      let _ = self.changes.send(event);
    }
  }

  fn write(&self, items: Vec<(String, Option<String>)>) -> Result<Vec<ChangeEvent>, StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let mut events = Vec::new();

    for (key, value) in items {
      let old_value: Option<String> = tx
        .query_row(
          "SELECT value FROM kv_store WHERE key = ?",
          params![key],
          |row| row.get(0),
        )
        .optional()?;

      if old_value == value {
        continue;
      }

      match &value {
        Some(v) => {
          tx.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
             VALUES (?, ?, datetime('now'))",
            params![key, v],
          )?;
        }
        None => {
          tx.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
        }
      }

      tx.execute(
        "INSERT INTO kv_changes (key, old_value, new_value, origin) VALUES (?, ?, ?, ?)",
        params![key, old_value, value, self.origin],
      )?;

      events.push(ChangeEvent {
        key,
        old_value,
        new_value: value,
      });
    }

    // Every poller has long caught up with rows this old
    tx.execute(
      "DELETE FROM kv_changes WHERE changed_at < datetime('now', '-60 seconds')",
      [],
    )?;
    tx.commit()?;

    Ok(events)
  }
}

impl Drop for SqliteBackend {
  fn drop(&mut self) {
    self.poller.abort();
  }
}

impl StorageBackend for SqliteBackend {
  fn get(&self, keys: Vec<String>) -> StorageFuture<'_, HashMap<String, String>> {
    async move {
      let conn = self.lock()?;
      let mut stmt = conn.prepare_cached("SELECT value FROM kv_store WHERE key = ?")?;
      let mut found = HashMap::new();
      for key in keys {
        let value: Option<String> = stmt.query_row(params![key], |row| row.get(0)).optional()?;
        if let Some(value) = value {
          found.insert(key, value);
        }
      }
      Ok(found)
    }
    .boxed()
  }

  fn set(&self, items: Vec<(String, String)>) -> StorageFuture<'_, ()> {
    async move {
      let events = self.write(items.into_iter().map(|(k, v)| (k, Some(v))).collect())?;
      self.publish(events);
      Ok(())
    }
    .boxed()
  }

  fn remove(&self, key: String) -> StorageFuture<'_, ()> {
    async move {
      let events = self.write(vec![(key, None)])?;
      self.publish(events);
      Ok(())
    }
    .boxed()
  }

  fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
    self.changes.subscribe()
  }
}

/// Republish change-log rows written by other backends.
async fn poll_changes(
  conn: Arc<Mutex<Connection>>,
  origin: String,
  changes: broadcast::Sender<ChangeEvent>,
  mut last_seq: i64,
  poll_interval: Duration,
) {
  let mut ticker = tokio::time::interval(poll_interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

  loop {
    ticker.tick().await;

    let rows = match read_changes_since(&conn, last_seq) {
      Ok(rows) => rows,
      Err(e) => {
        warn!(error = %e, "failed to poll change log");
        continue;
      }
    };

    for (seq, row_origin, event) in rows {
      last_seq = seq;
      if row_origin != origin {
        let _ = changes.send(event);
      }
    }
  }
}

fn read_changes_since(
  conn: &Mutex<Connection>,
  last_seq: i64,
) -> Result<Vec<(i64, String, ChangeEvent)>, StorageError> {
  let conn = conn
    .lock()
    .map_err(|e| StorageError::Unavailable(format!("Lock poisoned: {}", e)))?;
  let mut stmt = conn.prepare_cached(
    "SELECT seq, origin, key, old_value, new_value FROM kv_changes
     WHERE seq > ?
     ORDER BY seq",
  )?;

  let rows = stmt
    .query_map(params![last_seq], |row| {
      Ok((
        row.get(0)?,
        row.get(1)?,
        ChangeEvent {
          key: row.get(2)?,
          old_value: row.get(3)?,
          new_value: row.get(4)?,
        },
      ))
    })?
    .collect::<Result<Vec<_>, _>>()?;

  Ok(rows)
}
