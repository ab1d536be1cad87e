//! Tablet Meta Store
//!
//! Persistent storage for tablet metas, one SQLite database per data dir.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::error::Result;
use crate::tablet::TabletMeta;

/// Tablet meta store backed by SQLite
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Create or open the meta database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tablet_meta (
                tablet_id INTEGER NOT NULL,
                schema_hash INTEGER NOT NULL,
                meta BLOB NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (tablet_id, schema_hash)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a tablet meta
    pub fn save(&self, meta: &TabletMeta) -> Result<()> {
        let bytes = meta.serialize()?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO tablet_meta (tablet_id, schema_hash, meta) VALUES (?1, ?2, ?3)
            ON CONFLICT(tablet_id, schema_hash) DO UPDATE SET
                meta = ?3,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![meta.tablet_id, meta.schema_hash, bytes],
        )?;
        Ok(())
    }

    /// Get one tablet meta
    pub fn get(&self, tablet_id: i64, schema_hash: i32) -> Result<Option<TabletMeta>> {
        let conn = self.conn.lock();
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT meta FROM tablet_meta WHERE tablet_id = ?1 AND schema_hash = ?2",
                params![tablet_id, schema_hash],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => Ok(Some(TabletMeta::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a tablet meta; returns whether a row was deleted
    pub fn remove(&self, tablet_id: i64, schema_hash: i32) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM tablet_meta WHERE tablet_id = ?1 AND schema_hash = ?2",
            params![tablet_id, schema_hash],
        )?;
        Ok(deleted > 0)
    }

    /// All stored tablet metas
    pub fn load_all(&self) -> Result<Vec<TabletMeta>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT meta FROM tablet_meta ORDER BY tablet_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut metas = Vec::new();
        for bytes in rows {
            metas.push(TabletMeta::deserialize(&bytes?)?);
        }
        Ok(metas)
    }
}
