//! SQLite persistence for the work store and run history.
//!
//! One file holds everything a resumed run needs: the candidate id set
//! with processed flags, the extracted records as JSON payloads, and a
//! small run log. Records are keyed by candidate id, so re-running a
//! harvest against the same file only ever adds work.

use placerake_harvester::error::{HarvestError, Result};
use placerake_harvester::id::CandidateId;
use placerake_harvester::record::Record;
use placerake_harvester::store::StoreBackend;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn db_err(e: rusqlite::Error) -> HarvestError {
    HarvestError::StoreError(e.to_string())
}

fn json_err(e: serde_json::Error) -> HarvestError {
    HarvestError::StoreError(e.to_string())
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(db_err)?;

    // Optimize for concurrent writers sharing the file
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -64000;  -- 64MB cache
        PRAGMA temp_store = MEMORY;
        ",
    )
    .map_err(db_err)?;

    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS candidate_ids (
            id TEXT PRIMARY KEY,
            discovered_at INTEGER NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_candidates_processed ON candidate_ids(processed);

        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,  -- JSON-serialized record
            stored_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            query TEXT NOT NULL,
            place TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            status TEXT NOT NULL CHECK(status IN ('running', 'completed', 'failed'))
        );
        ",
    )
    .map_err(db_err)
}

/// Durable [`StoreBackend`] over a single SQLite file.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }
}

impl StoreBackend for SqliteBackend {
    fn insert_ids(&mut self, ids: &[CandidateId]) -> Result<usize> {
        let now = current_timestamp();
        let tx = self.conn.transaction().map_err(db_err)?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO candidate_ids (id, discovered_at) VALUES (?1, ?2)",
                )
                .map_err(db_err)?;
            for id in ids {
                inserted += stmt.execute(params![id.as_str(), now]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(inserted)
    }

    fn insert_record(&mut self, id: &CandidateId, record: &Record) -> Result<bool> {
        let payload = serde_json::to_string(record).map_err(json_err)?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO records (id, payload, stored_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), payload, current_timestamp()],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    fn mark_processed(&mut self, ids: &[CandidateId]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached("UPDATE candidate_ids SET processed = 1 WHERE id = ?1")
                .map_err(db_err)?;
            for id in ids {
                stmt.execute(params![id.as_str()]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    fn unprocessed(&mut self, limit: Option<usize>) -> Result<Vec<CandidateId>> {
        let cap = limit.map(|n| n as i64).unwrap_or(-1);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT id FROM candidate_ids WHERE processed = 0
                 ORDER BY discovered_at, id LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![cap], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(CandidateId::from_trusted(row.map_err(db_err)?));
        }
        Ok(out)
    }

    fn get_record(&mut self, id: &CandidateId) -> Result<Option<Record>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM records WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(json_err)?)),
            None => Ok(None),
        }
    }

    fn put_record(&mut self, id: &CandidateId, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(record).map_err(json_err)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO records (id, payload, stored_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), payload, current_timestamp()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn all_records(&mut self) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT payload FROM records ORDER BY stored_at, id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row.map_err(db_err)?).map_err(json_err)?);
        }
        Ok(out)
    }

    fn id_count(&mut self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM candidate_ids")
    }

    fn processed_count(&mut self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM candidate_ids WHERE processed = 1")
    }

    fn record_count(&mut self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM records")
    }
}

impl SqliteBackend {
    fn count(&self, sql: &str) -> Result<usize> {
        self.conn
            .query_row(sql, [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(db_err)
    }
}

/// Run history on the same file, held on its own connection so the
/// orchestrator can log without going through the store facade.
pub struct RunLog {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    /// Records a new run and returns its id.
    pub fn begin(&self, query: &str, place: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO runs (id, query, place, started_at, status)
                 VALUES (?1, ?2, ?3, ?4, 'running')",
                params![id, query, place, current_timestamp()],
            )
            .map_err(db_err)?;
        Ok(id)
    }

    pub fn finish(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, status = ?2 WHERE id = ?3",
                params![current_timestamp(), status.as_str(), run_id],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(range: std::ops::Range<usize>) -> Vec<CandidateId> {
        range
            .map(|i| CandidateId::from_trusted(format!("ChIJ{:0>20}", i)))
            .collect()
    }

    #[test]
    fn insert_is_deduplicating_across_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("work.db");

        let mut backend = SqliteBackend::open(&path).unwrap();
        assert_eq!(backend.insert_ids(&ids(0..10)).unwrap(), 10);
        assert_eq!(backend.insert_ids(&ids(5..15)).unwrap(), 5);
        drop(backend);

        let mut reopened = SqliteBackend::open(&path).unwrap();
        assert_eq!(reopened.id_count().unwrap(), 15);
        assert_eq!(reopened.insert_ids(&ids(0..15)).unwrap(), 0);
    }

    #[test]
    fn processed_flags_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("work.db");
        let all = ids(0..6);

        let mut backend = SqliteBackend::open(&path).unwrap();
        backend.insert_ids(&all).unwrap();
        backend.mark_processed(&all[..4]).unwrap();
        drop(backend);

        let mut reopened = SqliteBackend::open(&path).unwrap();
        let remaining = reopened.unprocessed(None).unwrap();
        assert_eq!(remaining, all[4..].to_vec());
        assert_eq!(reopened.processed_count().unwrap(), 4);
    }

    #[test]
    fn record_insert_then_replace() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(&dir.path().join("work.db")).unwrap();
        let id = CandidateId::from_trusted("ChIJ00000000000000000001".to_string());
        let record = Record::new(&id, "Cafe de la Gare".to_string());

        assert!(backend.insert_record(&id, &record).unwrap());
        assert!(!backend.insert_record(&id, &record).unwrap());

        let mut enriched = record.clone();
        enriched.email = "contact@gare.fr".to_string();
        backend.put_record(&id, &enriched).unwrap();

        let stored = backend.get_record(&id).unwrap().unwrap();
        assert_eq!(stored.email, "contact@gare.fr");
        assert_eq!(backend.record_count().unwrap(), 1);
    }

    #[test]
    fn run_log_tracks_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("work.db");
        let log = RunLog::open(&path).unwrap();

        let run_id = log.begin("bakeries", "Paris, France").unwrap();
        log.finish(&run_id, RunStatus::Completed).unwrap();

        let status: String = log
            .conn
            .query_row(
                "SELECT status FROM runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "completed");
    }
}
