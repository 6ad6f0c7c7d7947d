use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;

use super::types::{AppendOutcome, ProfileStore};
use super::StoreError;
use crate::db::{self, repository, SnapshotInsert};
use crate::models::*;

fn out_of_order(user_id: &str) -> StoreError {
    StoreError::WriteConflict {
        user_id: user_id.to_string(),
        reason: "snapshot is older than the latest history entry".into(),
    }
}

/// In-memory profiles for testing.
#[derive(Default)]
pub struct InMemoryProfileStore {
    records: Mutex<HashMap<String, ProfileRecord>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn load(&self, user_id: &str) -> Result<ProfileRecord, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| ProfileRecord::empty(user_id)))
    }

    async fn append_snapshot(&self, snapshot: &ProfileSnapshot) -> Result<AppendOutcome, StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        let record = records
            .entry(snapshot.user_id.clone())
            .or_insert_with(|| ProfileRecord::empty(&snapshot.user_id));

        if record.contains_snapshot(&snapshot.id) {
            return Ok(AppendOutcome::AlreadyPresent);
        }
        if record
            .last_recorded()
            .is_some_and(|last| snapshot.recorded_at < last)
        {
            return Err(out_of_order(&snapshot.user_id));
        }
        record.history.push(snapshot.clone());
        Ok(AppendOutcome::Appended)
    }

    async fn save_derived_tags(&self, user_id: &str, tags: &DerivedRiskTags) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        records
            .entry(user_id.to_string())
            .or_insert_with(|| ProfileRecord::empty(user_id))
            .derived_tags = tags.clone();
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut users: Vec<String> = records
            .values()
            .filter(|r| !r.history.is_empty())
            .map(|r| r.user_id.clone())
            .collect();
        users.sort();
        Ok(users)
    }
}

/// SQLite-backed profiles. Blocking work runs on the blocking pool.
pub struct SqliteProfileStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProfileStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_connection(db::open_database(path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl ProfileStore for SqliteProfileStore {
    async fn load(&self, user_id: &str) -> Result<ProfileRecord, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let history = repository::get_profile_history(conn, &user_id)?;
            let derived_tags = repository::get_derived_tags(conn, &user_id)?.unwrap_or_default();
            Ok(ProfileRecord {
                user_id,
                history,
                derived_tags,
            })
        })
        .await
    }

    async fn append_snapshot(&self, snapshot: &ProfileSnapshot) -> Result<AppendOutcome, StoreError> {
        let snapshot = snapshot.clone();
        self.with_conn(move |conn| match repository::insert_snapshot(conn, &snapshot)? {
            SnapshotInsert::Inserted => Ok(AppendOutcome::Appended),
            SnapshotInsert::Duplicate => Ok(AppendOutcome::AlreadyPresent),
            SnapshotInsert::OutOfOrder => Err(out_of_order(&snapshot.user_id)),
        })
        .await
    }

    async fn save_derived_tags(&self, user_id: &str, tags: &DerivedRiskTags) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let tags = tags.clone();
        self.with_conn(move |conn| Ok(repository::upsert_derived_tags(conn, &user_id, &tags)?))
            .await
    }

    async fn list_users(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| Ok(repository::list_profile_users(conn)?)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn snapshot(user: &str, at: DateTime<Utc>) -> ProfileSnapshot {
        ProfileSnapshot {
            id: Uuid::new_v4(),
            user_id: user.into(),
            recorded_at: at,
            findings: vec![Finding::new("glucose", "5.2")],
            flags: vec![],
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
    }

    async fn exercise_store(store: &dyn ProfileStore) {
        assert!(store.load("u1").await.unwrap().history.is_empty());

        let first = snapshot("u1", t0());
        assert_eq!(store.append_snapshot(&first).await.unwrap(), AppendOutcome::Appended);
        assert_eq!(
            store.append_snapshot(&first).await.unwrap(),
            AppendOutcome::AlreadyPresent
        );

        let stale = snapshot("u1", t0() - Duration::hours(1));
        assert!(matches!(
            store.append_snapshot(&stale).await,
            Err(StoreError::WriteConflict { .. })
        ));

        store
            .append_snapshot(&snapshot("u1", t0() + Duration::days(1)))
            .await
            .unwrap();

        let tags = DerivedRiskTags {
            total_snapshots: 2,
            ..Default::default()
        };
        store.save_derived_tags("u1", &tags).await.unwrap();

        let record = store.load("u1").await.unwrap();
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history[0].id, first.id);
        assert_eq!(record.derived_tags, tags);
        assert!(store.load("u2").await.unwrap().history.is_empty());

        store.save_derived_tags("u3", &DerivedRiskTags::default()).await.unwrap();
        store.append_snapshot(&snapshot("u0", t0())).await.unwrap();
        assert_eq!(store.list_users().await.unwrap(), vec!["u0", "u1"]);
    }

    #[tokio::test]
    async fn in_memory_store_semantics() {
        exercise_store(&InMemoryProfileStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteProfileStore::open(&dir.path().join("profiles.db")).unwrap();
        exercise_store(&store).await;
    }
}
