//! SQLite persistence for photozip's image derivatives.
//!
//! One database per user, at:
//!   ~/.photozip/derivatives.db
//!
//! Stores one row per absolute source path: the source modification time at
//! the moment the derivatives were generated, the untouched image dimensions,
//! the list thumbnail and (once an export has asked for it) the size-bounded
//! working copy. No business logic lives here; callers decide when a row is
//! stale or needs regenerating.
//!
//! Every write is a single statement, so a half-written entry is never
//! visible. Uses WAL mode so a reader does not block behind a background build.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Failures of the underlying storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("derivative database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create store directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no cached entry for {0}")]
    NotFound(String),

    #[error("unable to find home directory")]
    NoHomeDir,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A persisted derivative record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: String,
    /// Source mtime when `thumbnail`/`resized` were generated.
    pub mod_time: DateTime<Utc>,
    pub original_width: u32,
    pub original_height: u32,
    pub thumbnail: Vec<u8>,
    pub resized: Option<Vec<u8>>,
}

impl CacheEntry {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.original_width, self.original_height)
    }
}

/// Fields to overwrite on an existing entry. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct EntryUpdate {
    pub mod_time: Option<DateTime<Utc>>,
    pub dimensions: Option<(u32, u32)>,
    pub thumbnail: Option<Vec<u8>>,
    pub resized: Option<Vec<u8>>,
}

impl EntryUpdate {
    pub fn is_empty(&self) -> bool {
        self.mod_time.is_none()
            && self.dimensions.is_none()
            && self.thumbnail.is_none()
            && self.resized.is_none()
    }
}

/// Derivative database handle.
///
/// The connection sits behind a mutex so one store can be shared between the
/// interactive thread and the background builder; statements run one at a time.
pub struct DerivativeStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl DerivativeStore {
    /// Open or create the per-user derivative database.
    pub fn open_default() -> StoreResult<Self> {
        Self::open_at(&Self::default_location()?)
    }

    /// The fixed per-user database location.
    pub fn default_location() -> StoreResult<PathBuf> {
        let home = dirs::home_dir().ok_or(StoreError::NoHomeDir)?;
        Ok(home.join(".photozip").join("derivatives.db"))
    }

    /// Open a database at a specific path, creating parent directories and
    /// the schema if needed.
    pub fn open_at(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(db_path)?;

        // WAL mode for concurrent read/write
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        store.create_tables()?;
        debug!(path = %db_path.display(), "opened derivative store");
        Ok(store)
    }

    /// Open a private in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: PathBuf::from(":memory:"),
        };
        store.create_tables()?;
        Ok(store)
    }

    /// Get the database file path.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    // -- Schema --

    fn create_tables(&self) -> StoreResult<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS derivatives (
                path TEXT PRIMARY KEY,
                mod_time INTEGER NOT NULL,
                original_width INTEGER NOT NULL,
                original_height INTEGER NOT NULL,
                thumbnail BLOB NOT NULL,
                resized BLOB
            );
            ",
        )?;
        Ok(())
    }

    // -- Reads --

    pub fn get(&self, path: &str) -> StoreResult<Option<CacheEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT path, mod_time, original_width, original_height, thumbnail, resized
                 FROM derivatives WHERE path = ?1",
                params![path],
                |row| {
                    Ok(CacheEntry {
                        path: row.get(0)?,
                        mod_time: millis_to_time(row.get(1)?),
                        original_width: row.get(2)?,
                        original_height: row.get(3)?,
                        thumbnail: row.get(4)?,
                        resized: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn exists(&self, path: &str) -> StoreResult<bool> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM derivatives WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )?;
        Ok(count == 1)
    }

    /// Whether the entry exists and already carries a resized copy.
    pub fn has_resized(&self, path: &str) -> StoreResult<bool> {
        let present: Option<bool> = self
            .conn
            .lock()
            .query_row(
                "SELECT resized IS NOT NULL FROM derivatives WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(present.unwrap_or(false))
    }

    /// Original pixel dimensions of the source, as recorded at build time.
    pub fn dimensions(&self, path: &str) -> StoreResult<(u32, u32)> {
        self.conn
            .lock()
            .query_row(
                "SELECT original_width, original_height FROM derivatives WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    pub fn thumbnail(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let blob = self
            .conn
            .lock()
            .query_row(
                "SELECT thumbnail FROM derivatives WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob)
    }

    pub fn resized(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let blob: Option<Option<Vec<u8>>> = self
            .conn
            .lock()
            .query_row(
                "SELECT resized FROM derivatives WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.flatten())
    }

    pub fn mod_time(&self, path: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let millis: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT mod_time FROM derivatives WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(millis.map(millis_to_time))
    }

    /// Every cached path with its recorded modification time.
    pub fn stamps(&self) -> StoreResult<Vec<(String, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT path, mod_time FROM derivatives ORDER BY path")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, millis_to_time(row.get(1)?)))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn count(&self) -> StoreResult<i64> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM derivatives", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- Writes --

    /// Insert an entry, or replace every column of the existing row for the
    /// same path. Concurrent puts are serialized; the last one wins whole.
    pub fn put(&self, entry: &CacheEntry) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO derivatives (
                path, mod_time, original_width, original_height, thumbnail, resized
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(path) DO UPDATE SET
                mod_time = excluded.mod_time,
                original_width = excluded.original_width,
                original_height = excluded.original_height,
                thumbnail = excluded.thumbnail,
                resized = excluded.resized",
            params![
                entry.path,
                time_to_millis(entry.mod_time),
                entry.original_width,
                entry.original_height,
                entry.thumbnail,
                entry.resized,
            ],
        )?;
        Ok(())
    }

    /// Overwrite only the given fields of an existing entry.
    pub fn update(&self, path: &str, update: &EntryUpdate) -> StoreResult<()> {
        let (width, height) = match update.dimensions {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        };
        let changed = self.conn.lock().execute(
            "UPDATE derivatives SET
                mod_time = COALESCE(?2, mod_time),
                original_width = COALESCE(?3, original_width),
                original_height = COALESCE(?4, original_height),
                thumbnail = COALESCE(?5, thumbnail),
                resized = COALESCE(?6, resized)
            WHERE path = ?1",
            params![
                path,
                update.mod_time.map(time_to_millis),
                width,
                height,
                update.thumbnail,
                update.resized,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(())
    }

    /// Remove an entry. Returns whether a row was deleted.
    pub fn delete(&self, path: &str) -> StoreResult<bool> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM derivatives WHERE path = ?1", params![path])?;
        Ok(removed > 0)
    }

    /// Drop every cached entry.
    pub fn clear(&self) -> StoreResult<usize> {
        let removed = self.conn.lock().execute("DELETE FROM derivatives", [])?;
        Ok(removed)
    }
}

fn time_to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn millis_to_time(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_store() -> (DerivativeStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = DerivativeStore::open_at(&db_path).unwrap();
        (store, dir)
    }

    fn sample_entry(path: &str) -> CacheEntry {
        CacheEntry {
            path: path.to_string(),
            mod_time: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            original_width: 1024,
            original_height: 768,
            thumbnail: vec![1, 2, 3],
            resized: None,
        }
    }

    #[test]
    fn test_create_and_count_empty() {
        let (store, _dir) = test_store();
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.stamps().unwrap().is_empty());
    }

    #[test]
    fn test_schema_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("derivatives.db");
        {
            let store = DerivativeStore::open_at(&db_path).unwrap();
            store.put(&sample_entry("/photos/a.jpg")).unwrap();
        }
        let store = DerivativeStore::open_at(&db_path).unwrap();
        assert!(store.exists("/photos/a.jpg").unwrap());
        assert_eq!(store.path(), db_path.as_path());
    }

    #[test]
    fn test_put_and_get() {
        let (store, _dir) = test_store();
        let entry = sample_entry("/photos/a.jpg");
        store.put(&entry).unwrap();

        let loaded = store.get("/photos/a.jpg").unwrap().unwrap();
        assert_eq!(loaded, entry);
        assert!(store.get("/photos/missing.jpg").unwrap().is_none());
    }

    #[test]
    fn test_put_replaces_existing_row() {
        let (store, _dir) = test_store();
        let mut entry = sample_entry("/photos/a.jpg");
        entry.resized = Some(vec![9, 9]);
        store.put(&entry).unwrap();

        entry.thumbnail = vec![4, 5, 6];
        entry.resized = None;
        store.put(&entry).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let loaded = store.get("/photos/a.jpg").unwrap().unwrap();
        assert_eq!(loaded.thumbnail, vec![4, 5, 6]);
        assert_eq!(loaded.resized, None);
    }

    #[test]
    fn test_update_changes_only_given_fields() {
        let (store, _dir) = test_store();
        store.put(&sample_entry("/photos/a.jpg")).unwrap();

        store
            .update(
                "/photos/a.jpg",
                &EntryUpdate {
                    resized: Some(vec![7, 7, 7]),
                    ..Default::default()
                },
            )
            .unwrap();

        let loaded = store.get("/photos/a.jpg").unwrap().unwrap();
        assert_eq!(loaded.resized, Some(vec![7, 7, 7]));
        assert_eq!(loaded.thumbnail, vec![1, 2, 3]);
        assert_eq!(loaded.dimensions(), (1024, 768));
        assert_eq!(loaded.mod_time, sample_entry("x").mod_time);
    }

    #[test]
    fn test_update_missing_entry_is_not_found() {
        let (store, _dir) = test_store();
        let err = store
            .update("/photos/none.jpg", &EntryUpdate::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(p) if p == "/photos/none.jpg"));
    }

    #[test]
    fn test_has_resized() {
        let (store, _dir) = test_store();
        assert!(!store.has_resized("/photos/a.jpg").unwrap());

        store.put(&sample_entry("/photos/a.jpg")).unwrap();
        assert!(!store.has_resized("/photos/a.jpg").unwrap());
        assert_eq!(store.resized("/photos/a.jpg").unwrap(), None);

        store
            .update(
                "/photos/a.jpg",
                &EntryUpdate {
                    resized: Some(vec![1]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(store.has_resized("/photos/a.jpg").unwrap());
        assert_eq!(store.resized("/photos/a.jpg").unwrap(), Some(vec![1]));
    }

    #[test]
    fn test_dimensions() {
        let (store, _dir) = test_store();
        store.put(&sample_entry("/photos/a.jpg")).unwrap();
        assert_eq!(store.dimensions("/photos/a.jpg").unwrap(), (1024, 768));

        let err = store.dimensions("/photos/b.jpg").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_delete() {
        let (store, _dir) = test_store();
        store.put(&sample_entry("/photos/a.jpg")).unwrap();

        assert!(store.delete("/photos/a.jpg").unwrap());
        assert!(!store.exists("/photos/a.jpg").unwrap());
        assert!(!store.delete("/photos/a.jpg").unwrap());
    }

    #[test]
    fn test_stamps_and_clear() {
        let (store, _dir) = test_store();
        for name in ["c", "a", "b"] {
            store.put(&sample_entry(&format!("/photos/{}.png", name))).unwrap();
        }

        let stamps = store.stamps().unwrap();
        let paths: Vec<_> = stamps.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/photos/a.png", "/photos/b.png", "/photos/c.png"]);
        assert_eq!(stamps[0].1, sample_entry("x").mod_time);
        assert_eq!(
            store.mod_time("/photos/a.png").unwrap(),
            Some(sample_entry("x").mod_time)
        );

        assert_eq!(store.clear().unwrap(), 3);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_puts_keep_one_whole_row() {
        let store = std::sync::Arc::new(DerivativeStore::open_in_memory().unwrap());
        let writers: Vec<_> = (0..8u8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut entry = sample_entry("/photos/shared.jpg");
                    entry.thumbnail = vec![i; 16];
                    entry.original_width = i as u32;
                    store.put(&entry).unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let loaded = store.get("/photos/shared.jpg").unwrap().unwrap();
        // Fields all come from the same writer.
        assert_eq!(loaded.thumbnail, vec![loaded.original_width as u8; 16]);
        assert_eq!(store.count().unwrap(), 1);
    }
}
