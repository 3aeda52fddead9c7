//! v001 -- Initial schema creation.
//!
//! A single `entries` table holding one JSON document per store path.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    path  TEXT PRIMARY KEY NOT NULL,   -- slash-separated, segments escaped
    value TEXT NOT NULL                -- JSON document
) WITHOUT ROWID;
"#;

/// Apply the v001 migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
