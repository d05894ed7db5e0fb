//! SQLite persistence: the `members` gallery and the `events` log.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::params;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use vigil_core::{Embedding, EventRow, OwnerId, PersistenceSink, PersonId, PersonRecord, SinkError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS members (
    member_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id     TEXT NOT NULL,
    first_name  TEXT,
    last_name   TEXT,
    descriptor  TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_members_team ON members(team_id);

CREATE TABLE IF NOT EXISTS events (
    event_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id           TEXT NOT NULL,
    date_time         TEXT NOT NULL,
    category          TEXT NOT NULL,
    member_id         INTEGER REFERENCES members(member_id) ON DELETE SET NULL,
    object_confidence REAL,
    CHECK (category = 'person' OR member_id IS NULL)
);
CREATE INDEX IF NOT EXISTS idx_events_team_time ON events(team_id, date_time);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to encode embedding: {0}")]
    Embedding(#[from] serde_json::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid event row: {0}")]
    InvalidRow(String),
}

impl From<StoreError> for SinkError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidRow(msg) => SinkError::Malformed(msg),
            StoreError::Embedding(e) => SinkError::Malformed(e.to_string()),
            other => SinkError::Unavailable(other.to_string()),
        }
    }
}

/// One row of event history, joined with the member's name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub event_id: i64,
    pub date_time: String,
    pub category: String,
    pub member_id: Option<PersonId>,
    pub member_name: Option<String>,
    pub object_confidence: Option<f64>,
}

pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "event store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Enroll a person with a face embedding.
    pub async fn add_member(
        &self,
        owner: &OwnerId,
        first_name: Option<&str>,
        last_name: Option<&str>,
        embedding: &Embedding,
    ) -> Result<PersonId, StoreError> {
        let descriptor = serde_json::to_string(embedding)?;
        let team_id = owner.as_str().to_string();
        let first_name = first_name.map(str::to_string);
        let last_name = last_name.map(str::to_string);
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO members (team_id, first_name, last_name, descriptor, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![team_id, first_name, last_name, descriptor, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        tracing::info!(owner = %owner, member = id, dim = embedding.dim(), "member enrolled");
        Ok(PersonId(id))
    }

    /// All members of `owner`, oldest first. A descriptor that does not parse
    /// is reported as a missing embedding.
    pub async fn load_members(&self, owner: &OwnerId) -> Result<Vec<PersonRecord>, StoreError> {
        let team_id = owner.as_str().to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT member_id, first_name, last_name, descriptor
                     FROM members WHERE team_id = ?1 ORDER BY member_id",
                )?;
                let rows = stmt
                    .query_map(params![team_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, first_name, last_name, descriptor)| {
                let embedding = descriptor.and_then(|text| match serde_json::from_str::<Embedding>(&text) {
                    Ok(e) => Some(e),
                    Err(e) => {
                        tracing::warn!(member = id, error = %e, "unreadable face descriptor");
                        None
                    }
                });
                PersonRecord {
                    person_id: PersonId(id),
                    first_name,
                    last_name,
                    embedding,
                }
            })
            .collect())
    }

    /// Insert a batch in one transaction. Rows that break the table
    /// invariants are skipped; a batch with no valid row is an error.
    pub async fn insert_rows(&self, rows: &[EventRow]) -> Result<usize, StoreError> {
        let mut valid = Vec::with_capacity(rows.len());
        let mut last_error = None;
        for row in rows {
            match validate_row(row) {
                Ok(()) => valid.push(row.clone()),
                Err(e) => {
                    tracing::warn!(category = %row.category, at = %row.date_time, error = %e, "skipping event row");
                    last_error = Some(e);
                }
            }
        }
        if valid.is_empty() {
            return match last_error {
                Some(e) => Err(e),
                None => Ok(0),
            };
        }
        let rows = valid;

        let written = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO events (team_id, date_time, category, member_id, object_confidence)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for row in &rows {
                        stmt.execute(params![
                            row.team_id,
                            row.date_time,
                            row.category,
                            row.member_id.flatten().map(|id| id.0),
                            row.object_confidence.map(f64::from),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(rows.len())
            })
            .await?;

        Ok(written)
    }

    /// Event history for `owner`, newest first.
    pub async fn list_events(&self, owner: &OwnerId, limit: u32) -> Result<Vec<StoredEvent>, StoreError> {
        let team_id = owner.as_str().to_string();
        let events = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT e.event_id, e.date_time, e.category, e.member_id,
                            m.first_name, m.last_name, e.object_confidence
                     FROM events e
                     LEFT JOIN members m ON m.member_id = e.member_id
                     WHERE e.team_id = ?1
                     ORDER BY e.date_time DESC, e.event_id DESC
                     LIMIT ?2",
                )?;
                let events = stmt
                    .query_map(params![team_id, limit], |row| {
                        let first: Option<String> = row.get(4)?;
                        let last: Option<String> = row.get(5)?;
                        let member_name = match (first, last) {
                            (Some(f), Some(l)) => Some(format!("{f} {l}")),
                            (Some(n), None) | (None, Some(n)) => Some(n),
                            (None, None) => None,
                        };
                        Ok(StoredEvent {
                            event_id: row.get(0)?,
                            date_time: row.get(1)?,
                            category: row.get(2)?,
                            member_id: row.get::<_, Option<i64>>(3)?.map(PersonId),
                            member_name,
                            object_confidence: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await?;
        Ok(events)
    }
}

/// Person rows must carry the `member_id` key; no other category may.
fn validate_row(row: &EventRow) -> Result<(), StoreError> {
    if row.category.trim().is_empty() {
        return Err(StoreError::InvalidRow("empty category".into()));
    }
    match (row.is_person(), row.member_id.is_some()) {
        (true, false) => Err(StoreError::InvalidRow(
            "person event without member_id".into(),
        )),
        (false, true) => Err(StoreError::InvalidRow(format!(
            "{} event carries member_id",
            row.category
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl PersistenceSink for SqliteStore {
    async fn load_gallery(&self, owner: &OwnerId) -> Result<Vec<PersonRecord>, SinkError> {
        Ok(self.load_members(owner).await?)
    }

    async fn insert_events(&self, batch: &[EventRow]) -> Result<(), SinkError> {
        self.insert_rows(batch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(category: &str, member_id: Option<Option<PersonId>>, at: &str) -> EventRow {
        EventRow {
            team_id: "team-1".into(),
            date_time: at.into(),
            category: category.into(),
            member_id,
            object_confidence: Some(0.5),
        }
    }

    #[tokio::test]
    async fn test_members_round_trip_into_gallery_records() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let owner = OwnerId::new("team-1");
        let id = store
            .add_member(&owner, Some("Jane"), Some("Doe"), &Embedding::new(vec![0.1, 0.2]))
            .await
            .unwrap();
        store
            .add_member(&OwnerId::new("team-2"), Some("John"), None, &Embedding::new(vec![0.3]))
            .await
            .unwrap();

        let records = store.load_gallery(&owner).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].person_id, id);
        assert_eq!(records[0].first_name.as_deref(), Some("Jane"));
        assert_eq!(records[0].embedding, Some(Embedding::new(vec![0.1, 0.2])));
    }

    #[tokio::test]
    async fn test_malformed_descriptor_becomes_missing_embedding() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO members (team_id, first_name, last_name, descriptor, created_at)
                     VALUES ('team-1', 'Bad', 'Data', 'not json', '2024-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let records = store.load_members(&OwnerId::new("team-1")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].embedding.is_none());
    }

    #[tokio::test]
    async fn test_insert_and_list_events_newest_first() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let owner = OwnerId::new("team-1");
        let jane = store
            .add_member(&owner, Some("Jane"), Some("Doe"), &Embedding::new(vec![0.0]))
            .await
            .unwrap();

        store
            .insert_events(&[
                row("person", Some(Some(jane)), "2024-11-05T09:00:00.000Z"),
                row("person", Some(None), "2024-11-05T09:00:01.000Z"),
                row("fire", None, "2024-11-05T09:00:02.000Z"),
            ])
            .await
            .unwrap();

        let events = store.list_events(&owner, 10).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].category, "fire");
        assert_eq!(events[0].member_id, None);
        assert_eq!(events[1].member_name, None);
        assert_eq!(events[2].member_id, Some(jane));
        assert_eq!(events[2].member_name.as_deref(), Some("Jane Doe"));

        let limited = store.list_events(&owner, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(store.list_events(&OwnerId::new("other"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_rows_are_skipped_individually() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let owner = OwnerId::new("team-1");

        let written = store
            .insert_rows(&[
                row("gun", None, "2024-11-05T09:00:00.000Z"),
                row("", None, "2024-11-05T09:00:01.000Z"),
                row("fire", Some(None), "2024-11-05T09:00:02.000Z"),
                row("backpack", None, "2024-11-05T09:00:03.000Z"),
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let categories: Vec<String> = store
            .list_events(&owner, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.category)
            .collect();
        assert_eq!(categories, vec!["backpack", "gun"]);
    }

    #[tokio::test]
    async fn test_batch_without_valid_rows_is_rejected() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let owner = OwnerId::new("team-1");

        let err = store
            .insert_events(&[
                row("  ", None, "2024-11-05T09:00:00.000Z"),
                row("fire", Some(None), "2024-11-05T09:00:01.000Z"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Malformed(_)));

        let err = store
            .insert_rows(&[row("person", None, "2024-11-05T09:00:02.000Z")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow(_)));

        assert_eq!(store.insert_rows(&[]).await.unwrap(), 0);
        assert!(store.list_events(&owner, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = std::env::temp_dir().join(format!("vigil-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("events.db");

        let store = SqliteStore::open(&path).await.unwrap();
        store.insert_rows(&[row("gun", None, "2024-11-05T09:00:00.000Z")]).await.unwrap();
        assert!(path.exists());

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
