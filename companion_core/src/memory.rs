use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::collaborators::MemoryStore;

/// Long-term memory facts kept in SQLite, one row per (character, fact).
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open memory database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_facts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                character TEXT NOT NULL,
                fact TEXT NOT NULL,
                learned_at TEXT NOT NULL,
                UNIQUE(character, fact)
            );
            CREATE INDEX IF NOT EXISTS idx_memory_facts_character
                ON memory_facts(character, id);",
        )
        .context("Failed to create memory schema")?;
        Ok(())
    }

    #[cfg(test)]
    fn count_facts(&self, character: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_facts WHERE character = ?1",
            [character],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl MemoryStore for SqliteMemoryStore {
    fn load_facts(&self, character: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT fact FROM memory_facts
             WHERE character = ?1
             ORDER BY id ASC",
        )?;
        let facts = stmt
            .query_map([character], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(facts)
    }

    fn add_fact(&self, character: &str, fact: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO memory_facts (character, fact, learned_at)
             VALUES (?1, ?2, ?3)",
            params![character, fact, Utc::now().to_rfc3339()],
        )?;
        if inserted > 0 {
            tracing::debug!("Stored memory fact for '{}'", character);
        }
        Ok(())
    }
}
