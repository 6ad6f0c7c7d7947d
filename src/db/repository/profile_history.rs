use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

/// Result of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotInsert {
    Inserted,
    /// A snapshot with the same id is already stored.
    Duplicate,
    /// The snapshot is older than the user's latest entry.
    OutOfOrder,
}

/// Timestamps are stored with fixed precision so they compare lexically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// Append a snapshot to the end of a user's history.
pub fn insert_snapshot(
    conn: &Connection,
    snapshot: &ProfileSnapshot,
) -> Result<SnapshotInsert, DatabaseError> {
    let tx = conn.unchecked_transaction()?;

    let exists: bool = tx
        .query_row(
            "SELECT 1 FROM profile_snapshots WHERE id = ?1",
            params![snapshot.id.to_string()],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if exists {
        return Ok(SnapshotInsert::Duplicate);
    }

    let last: Option<(i64, String)> = tx
        .query_row(
            "SELECT seq, recorded_at FROM profile_snapshots
             WHERE user_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![snapshot.user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let recorded_at = format_timestamp(&snapshot.recorded_at);
    let seq = match last {
        Some((_, ref last_at)) if recorded_at < *last_at => {
            return Ok(SnapshotInsert::OutOfOrder);
        }
        Some((seq, _)) => seq + 1,
        None => 1,
    };

    let findings_json = serde_json::to_string(&snapshot.findings)
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;
    let flags_json = serde_json::to_string(&snapshot.flags)
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;

    tx.execute(
        "INSERT INTO profile_snapshots (id, user_id, seq, recorded_at, findings_json, flags_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            snapshot.id.to_string(),
            snapshot.user_id,
            seq,
            recorded_at,
            findings_json,
            flags_json,
        ],
    )?;
    tx.commit()?;
    Ok(SnapshotInsert::Inserted)
}

/// Full history of a user, oldest first.
pub fn get_profile_history(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<ProfileSnapshot>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, recorded_at, findings_json, flags_json
         FROM profile_snapshots WHERE user_id = ?1 ORDER BY seq ASC",
    )?;

    let rows = stmt.query_map(params![user_id], |row| {
        Ok(SnapshotRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            recorded_at: row.get(2)?,
            findings_json: row.get(3)?,
            flags_json: row.get(4)?,
        })
    })?;

    let mut history = Vec::new();
    for row in rows {
        history.push(row?.into_snapshot()?);
    }
    Ok(history)
}

pub fn count_profile_snapshots(conn: &Connection, user_id: &str) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM profile_snapshots WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Users with at least one snapshot, for batch profile syncs.
pub fn list_profile_users(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT user_id FROM profile_snapshots ORDER BY user_id")?;
    let users = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Overwrite the derived tag summary of a user.
pub fn upsert_derived_tags(
    conn: &Connection,
    user_id: &str,
    tags: &DerivedRiskTags,
) -> Result<(), DatabaseError> {
    let tags_json = serde_json::to_string(tags)
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;
    conn.execute(
        "INSERT INTO profile_derived_tags (user_id, tags_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
           tags_json = excluded.tags_json,
           updated_at = excluded.updated_at",
        params![user_id, tags_json, format_timestamp(&Utc::now())],
    )?;
    Ok(())
}

pub fn get_derived_tags(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<DerivedRiskTags>, DatabaseError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT tags_json FROM profile_derived_tags WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|json| {
        serde_json::from_str(&json).map_err(|e| DatabaseError::CorruptRow {
            entity_type: "profile_derived_tags".into(),
            id: user_id.to_string(),
            reason: e.to_string(),
        })
    })
    .transpose()
}

struct SnapshotRow {
    id: String,
    user_id: String,
    recorded_at: String,
    findings_json: String,
    flags_json: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<ProfileSnapshot, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::CorruptRow {
            entity_type: "profile_snapshot".into(),
            id: self.id.clone(),
            reason,
        };

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let recorded_at = parse_timestamp(&self.recorded_at).map_err(|e| corrupt(e.to_string()))?;
        let findings = serde_json::from_str(&self.findings_json).map_err(|e| corrupt(e.to_string()))?;
        let flags = serde_json::from_str(&self.flags_json).map_err(|e| corrupt(e.to_string()))?;

        Ok(ProfileSnapshot {
            id,
            user_id: self.user_id.clone(),
            recorded_at,
            findings,
            flags,
        })
    }
}
