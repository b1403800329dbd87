use crate::error::StoreError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Attendance direction. The French vocabulary of the deployment is kept
/// verbatim; it is what the remote store and the operators expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Entree,
    Sortie,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Entree => "ENTREE",
            Direction::Sortie => "SORTIE",
        }
    }

    pub fn toggled(&self) -> Direction {
        match self {
            Direction::Entree => Direction::Sortie,
            Direction::Sortie => Direction::Entree,
        }
    }
}

impl FromStr for Direction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTREE" => Ok(Direction::Entree),
            "SORTIE" => Ok(Direction::Sortie),
            other => Err(StoreError::Corrupt(format!(
                "unknown direction {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the local mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub id: i64,
    pub employee_id: String,
    pub employee_name: String,
    pub rfid: String,
    pub timestamp: DateTime<Local>,
    pub direction: Direction,
}

/// Local SQLite mirror of committed attendance records.
///
/// The remote store is the source of truth; this mirror backs the on-site
/// dashboard and survives network outages read-only.
#[derive(Clone)]
pub struct AttendanceStore {
    pool: SqlitePool,
}

impl AttendanceStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("Attendance store opened at {}", path.as_ref().display());
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps the database
    /// alive for the pool's lifetime.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pointages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                employee_id TEXT NOT NULL,
                employee_name TEXT NOT NULL,
                rfid TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                direction TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pointages_employee
             ON pointages (employee_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn append(
        &self,
        employee_id: &str,
        employee_name: &str,
        rfid: &str,
        timestamp: DateTime<Local>,
        direction: Direction,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO pointages (employee_id, employee_name, rfid, timestamp, direction)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(employee_id)
        .bind(employee_name)
        .bind(rfid)
        .bind(timestamp.to_rfc3339())
        .bind(direction.as_str())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(
            "Stored {} for {} (row {})",
            direction.as_str(),
            employee_id,
            id
        );
        Ok(id)
    }

    /// Most recent record for an employee, by timestamp.
    pub async fn last_for_employee(
        &self,
        employee_id: &str,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, employee_id, employee_name, rfid, timestamp, direction
             FROM pointages
             WHERE employee_id = ?
             ORDER BY timestamp DESC, id DESC
             LIMIT 1",
        )
        .bind(employee_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    pub async fn records_between(
        &self,
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, employee_id, employee_name, rfid, timestamp, direction
             FROM pointages
             WHERE timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    /// Close the pool. Further queries fail; used on shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pointages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<AttendanceRecord, StoreError> {
    let timestamp: String = row.get("timestamp");
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {timestamp:?}: {e}")))?
        .with_timezone(&Local);

    let direction: String = row.get("direction");
    let direction = direction.parse()?;

    Ok(AttendanceRecord {
        id: row.get("id"),
        employee_id: row.get("employee_id"),
        employee_name: row.get("employee_name"),
        rfid: row.get("rfid"),
        timestamp,
        direction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_last_for_employee() {
        let store = AttendanceStore::open_in_memory().await.unwrap();

        store
            .append("EMP001", "Alice Martin", "A1B2C3", at(8, 0), Direction::Entree)
            .await
            .unwrap();
        store
            .append("EMP001", "Alice Martin", "A1B2C3", at(12, 0), Direction::Sortie)
            .await
            .unwrap();
        store
            .append("EMP002", "Bob Durand", "D4E5F6", at(9, 0), Direction::Entree)
            .await
            .unwrap();

        let last = store.last_for_employee("EMP001").await.unwrap().unwrap();
        assert_eq!(last.direction, Direction::Sortie);
        assert_eq!(last.timestamp, at(12, 0));

        assert!(store.last_for_employee("EMP999").await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_records_between() {
        let store = AttendanceStore::open_in_memory().await.unwrap();

        store
            .append("EMP001", "Alice", "A1", at(7, 0), Direction::Entree)
            .await
            .unwrap();
        store
            .append("EMP001", "Alice", "A1", at(10, 0), Direction::Sortie)
            .await
            .unwrap();
        store
            .append("EMP001", "Alice", "A1", at(18, 0), Direction::Entree)
            .await
            .unwrap();

        let between = store.records_between(at(8, 0), at(12, 0)).await.unwrap();
        assert_eq!(between.len(), 1);
        assert_eq!(between[0].direction, Direction::Sortie);
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pointeuse.db");

        let store = AttendanceStore::open(&path).await.unwrap();
        store
            .append("EMP001", "Alice", "A1", at(8, 0), Direction::Entree)
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[test]
    fn test_direction_toggle_and_parse() {
        assert_eq!(Direction::Entree.toggled(), Direction::Sortie);
        assert_eq!(Direction::Sortie.toggled(), Direction::Entree);
        assert_eq!("ENTREE".parse::<Direction>().unwrap(), Direction::Entree);
        assert!("INOUT".parse::<Direction>().is_err());
    }
}
