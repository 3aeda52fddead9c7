//! SQLite-backed [`Store`].
//!
//! Every record is one row of the `entries` table, keyed by its full path.
//! Subtree and children queries are range scans over the primary key.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::path::{unescape, StorePath};
use crate::{Entry, ListQuery, Store};

/// Wrapper around a [`rusqlite::Connection`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the default database for `app`.
    ///
    /// The file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/<app>/<app>.db`
    /// - macOS:   `~/Library/Application Support/com.missive.<app>/<app>.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\missive\<app>\data\<app>.db`
    pub fn open_default(app: &str) -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "missive", app).ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join(format!("{app}.db"));

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn decode(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, path: &StorePath) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM entries WHERE path = ?1",
                params![path.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.as_deref().map(decode).transpose()
    }

    async fn put(&self, path: &StorePath, value: Value) -> Result<()> {
        let raw = serde_json::to_string(&value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO entries (path, value) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET value = excluded.value",
            params![path.as_str(), raw],
        )?;
        Ok(())
    }

    async fn del(&self, path: &StorePath) -> Result<()> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM entries WHERE path = ?1 OR (path >= ?2 AND path < ?3)",
            params![
                path.as_str(),
                path.descendants_start(),
                path.descendants_end()
            ],
        )?;
        tracing::trace!(path = %path, removed, "deleted subtree");
        Ok(())
    }

    async fn list(&self, path: &StorePath, query: ListQuery) -> Result<Vec<Entry>> {
        let prefix = path.descendants_start();
        // SQLite treats a negative LIMIT as unbounded
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT substr(path, ?4), value FROM entries
             WHERE path >= ?1 AND path < ?2 AND instr(substr(path, ?4), '/') = 0
             ORDER BY path ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                prefix,
                path.descendants_end(),
                limit,
                prefix.chars().count() as i64 + 1
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            entries.push(Entry {
                key: unescape(&key),
                value: if query.values { Some(decode(&raw)?) } else { None },
            });
        }
        Ok(entries)
    }
}
