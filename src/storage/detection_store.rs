use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub species: String,
    pub confidence: f32,
    pub image_path: String,
    pub timestamp: DateTime<Utc>,
    pub interesting_fact: String,
}

/// Durable detection records. The pipeline only ever calls [`add`]; the
/// remaining operations belong to the HTTP layer.
///
/// [`add`]: DetectionStore::add
pub trait DetectionStore: Send + Sync {
    fn add(
        &self,
        species: &str,
        confidence: f32,
        image_path: &str,
        interesting_fact: &str,
    ) -> Result<i64, StoreError>;

    /// Most recent first.
    fn list(&self, limit: usize) -> Result<Vec<DetectionRecord>, StoreError>;

    /// Returns `false` if no record has this id.
    fn update(
        &self,
        id: i64,
        species: &str,
        confidence: f32,
        interesting_fact: &str,
    ) -> Result<bool, StoreError>;

    /// Returns `false` if no record has this id.
    fn delete(&self, id: i64) -> Result<bool, StoreError>;

    fn clear(&self) -> Result<usize, StoreError>;
}

pub struct SqliteDetectionStore {
    conn: Mutex<Connection>,
}

impl SqliteDetectionStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              species TEXT NOT NULL,
              confidence REAL NOT NULL,
              image_path TEXT NOT NULL,
              timestamp TEXT NOT NULL,
              interesting_fact TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn add(
        &self,
        species: &str,
        confidence: f32,
        image_path: &str,
        interesting_fact: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO detections (species, confidence, image_path, timestamp, interesting_fact)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                species,
                confidence as f64,
                image_path,
                Utc::now(),
                interesting_fact
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list(&self, limit: usize) -> Result<Vec<DetectionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, species, confidence, image_path, timestamp, interesting_fact
             FROM detections ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            let confidence: f64 = row.get(2)?;
            Ok(DetectionRecord {
                id: row.get(0)?,
                species: row.get(1)?,
                confidence: confidence as f32,
                image_path: row.get(3)?,
                timestamp: row.get(4)?,
                interesting_fact: row.get(5)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn update(
        &self,
        id: i64,
        species: &str,
        confidence: f32,
        interesting_fact: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE detections SET species = ?1, interesting_fact = ?2, confidence = ?3
             WHERE id = ?4",
            params![species, interesting_fact, confidence as f64, id],
        )?;
        Ok(changed > 0)
    }

    fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self
            .conn()?
            .execute("DELETE FROM detections WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn clear(&self) -> Result<usize, StoreError> {
        Ok(self.conn()?.execute("DELETE FROM detections", [])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_list_most_recent_first() {
        let store = SqliteDetectionStore::open_in_memory().unwrap();
        let first = store.add("Blue Jay", 0.81, "captures/a.jpg", "Visual match confirmed").unwrap();
        let second = store.add("House Finch", 0.22, "captures/b.jpg", "Low confidence match").unwrap();
        assert!(second > first);

        let records = store.list(10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, second);
        assert_eq!(records[0].species, "House Finch");
        assert!((records[0].confidence - 0.22).abs() < 1e-6);
        assert_eq!(records[1].image_path, "captures/a.jpg");

        assert_eq!(store.list(1).unwrap().len(), 1);
    }

    #[test]
    fn test_update_and_delete_report_missing_ids() {
        let store = SqliteDetectionStore::open_in_memory().unwrap();
        let id = store.add("Robin", 0.5, "captures/r.jpg", "").unwrap();

        assert!(store.update(id, "American Robin", 0.9, "Corrected by hand").unwrap());
        assert!(!store.update(id + 100, "Nobody", 0.1, "").unwrap());

        let record = &store.list(10).unwrap()[0];
        assert_eq!(record.species, "American Robin");
        assert_eq!(record.interesting_fact, "Corrected by hand");

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(store.list(10).unwrap().is_empty());
    }

    #[test]
    fn test_clear_removes_everything() {
        let store = SqliteDetectionStore::open_in_memory().unwrap();
        for i in 0..3 {
            store.add("Sparrow", 0.3, &format!("captures/{i}.jpg"), "").unwrap();
        }
        assert_eq!(store.clear().unwrap(), 3);
        assert!(store.list(10).unwrap().is_empty());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.db");
        {
            let store = SqliteDetectionStore::open(&path).unwrap();
            store.add("Cardinal", 0.7, "captures/c.jpg", "").unwrap();
        }
        let store = SqliteDetectionStore::open(&path).unwrap();
        assert_eq!(store.list(10).unwrap()[0].species, "Cardinal");
    }
}
