use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::derive::derive_tags;
use super::locks::UserLocks;
use super::ProfileError;
use crate::config::ProfileConfig;
use crate::models::*;
use crate::pipeline::storage::{call_with_retry, AppendOutcome, CallPolicy, ProfileStore, StoreError};

/// Acknowledgement of a profile sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncAck {
    pub user_id: String,
    /// Snapshots written by this sync; 0 when nothing was pending.
    pub appended: usize,
    pub total_snapshots: usize,
    pub derived_tags: DerivedRiskTags,
    /// False when the snapshots were written but storing the recomputed
    /// tags failed. The next sync writes them again.
    pub tags_saved: bool,
}

/// Findings waiting to be written. The snapshot id is fixed at staging so a
/// retried write cannot produce a duplicate entry.
#[derive(Debug, Clone)]
struct PendingEntry {
    id: Uuid,
    findings: Vec<Finding>,
    flags: Vec<RiskFlag>,
}

/// Sole writer of profile history. Writes for one user are serialized;
/// timestamps are assigned under that user's lock so history stays ordered.
pub struct ProfileUpdater {
    store: Arc<dyn ProfileStore>,
    locks: UserLocks,
    pending: Mutex<HashMap<String, Vec<PendingEntry>>>,
    severity_window: usize,
    write_retries: usize,
    policy: CallPolicy,
}

impl ProfileUpdater {
    pub fn new(store: Arc<dyn ProfileStore>, config: &ProfileConfig, policy: CallPolicy) -> Self {
        Self {
            store,
            locks: UserLocks::new(),
            pending: Mutex::new(HashMap::new()),
            severity_window: config.severity_window,
            write_retries: config.write_retries,
            policy,
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<PendingEntry>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a request's findings and flags for the next flush. Returns the
    /// id the snapshot will carry.
    pub fn stage(&self, user_id: &str, findings: Vec<Finding>, flags: Vec<RiskFlag>) -> Uuid {
        let id = Uuid::new_v4();
        self.pending_map()
            .entry(user_id.to_string())
            .or_default()
            .push(PendingEntry { id, findings, flags });
        tracing::debug!(user_id, snapshot_id = %id, "Profile snapshot staged");
        id
    }

    pub fn pending_count(&self, user_id: &str) -> usize {
        self.pending_map().get(user_id).map_or(0, Vec::len)
    }

    /// Stage and flush in one step.
    pub async fn record(
        &self,
        user_id: &str,
        findings: Vec<Finding>,
        flags: Vec<RiskFlag>,
    ) -> Result<SyncAck, ProfileError> {
        self.stage(user_id, findings, flags);
        self.flush(user_id).await
    }

    /// Write every pending entry for `user_id`, then recompute derived tags.
    /// Entries that could not be written stay pending for the next flush.
    pub async fn flush(&self, user_id: &str) -> Result<SyncAck, ProfileError> {
        let _guard = self.locks.acquire(user_id).await;

        let entries = self.pending_map().remove(user_id).unwrap_or_default();
        let mut record = match self.load(user_id).await {
            Ok(record) => record,
            Err(e) => {
                self.restore(user_id, entries);
                return Err(e.into());
            }
        };

        let mut appended = 0;
        for (index, entry) in entries.iter().enumerate() {
            match self.append_entry(user_id, entry, &mut record).await {
                Ok(true) => appended += 1,
                Ok(false) => {}
                Err(e) => {
                    self.restore(user_id, entries[index..].to_vec());
                    return Err(e);
                }
            }
        }

        let derived_tags = derive_tags(&record.history, self.severity_window);
        let mut tags_saved = true;
        if derived_tags != record.derived_tags {
            let store = &self.store;
            let tags = &derived_tags;
            let saved = call_with_retry(&self.policy, "profile_save_tags", move || async move {
                store.save_derived_tags(user_id, tags).await
            })
            .await;
            if let Err(e) = saved {
                tracing::warn!(user_id, appended, error = %e, "Derived tags not saved, history is written");
                tags_saved = false;
            }
        }

        tracing::info!(
            user_id,
            appended,
            total = record.history.len(),
            "Profile synced"
        );

        Ok(SyncAck {
            user_id: user_id.to_string(),
            appended,
            total_snapshots: record.history.len(),
            derived_tags,
            tags_saved,
        })
    }

    /// Flush every user with stored history or staged entries, recomputing
    /// their derived tags. A failing user is logged and skipped; the acks of
    /// the others are returned.
    pub async fn sync_all(&self) -> Result<Vec<SyncAck>, ProfileError> {
        let store = &self.store;
        let mut users = call_with_retry(&self.policy, "profile_list_users", move || async move {
            store.list_users().await
        })
        .await?;
        users.extend(self.pending_map().keys().cloned());
        users.sort();
        users.dedup();

        let mut acks = Vec::with_capacity(users.len());
        let mut failed = 0;
        for user_id in &users {
            match self.flush(user_id).await {
                Ok(ack) => acks.push(ack),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(user_id = %user_id, error = %e, "Batch profile sync failed for user");
                }
            }
        }
        tracing::info!(users = users.len(), failed, "Batch profile sync complete");
        Ok(acks)
    }

    async fn load(&self, user_id: &str) -> Result<ProfileRecord, StoreError> {
        let store = &self.store;
        call_with_retry(&self.policy, "profile_load", move || async move {
            store.load(user_id).await
        })
        .await
    }

    /// Append one entry, retrying ordering conflicts with a fresh timestamp.
    /// Returns whether a new snapshot was written.
    async fn append_entry(
        &self,
        user_id: &str,
        entry: &PendingEntry,
        record: &mut ProfileRecord,
    ) -> Result<bool, ProfileError> {
        let attempts = self.write_retries + 1;
        for attempt in 1..=attempts {
            // Stored timestamps carry microseconds.
            let now = Utc::now().trunc_subsecs(6);
            let recorded_at = record.last_recorded().map_or(now, |last| last.max(now));
            let snapshot = ProfileSnapshot {
                id: entry.id,
                user_id: user_id.to_string(),
                recorded_at,
                findings: entry.findings.clone(),
                flags: entry.flags.clone(),
            };

            let store = &self.store;
            let pending = &snapshot;
            let outcome = call_with_retry(&self.policy, "profile_append", move || async move {
                store.append_snapshot(pending).await
            })
            .await;

            match outcome {
                Ok(AppendOutcome::Appended) => {
                    record.history.push(snapshot);
                    return Ok(true);
                }
                Ok(AppendOutcome::AlreadyPresent) => {
                    if !record.contains_snapshot(&entry.id) {
                        *record = self.load(user_id).await?;
                    }
                    return Ok(false);
                }
                Err(StoreError::WriteConflict { reason, .. }) => {
                    tracing::warn!(user_id, attempt, reason = %reason, "Profile write conflict, retrying");
                    *record = self.load(user_id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ProfileError::ConflictExhausted {
            user_id: user_id.to_string(),
            attempts,
        })
    }

    fn restore(&self, user_id: &str, mut entries: Vec<PendingEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut pending = self.pending_map();
        let queue = pending.entry(user_id.to_string()).or_default();
        entries.append(queue);
        *queue = entries;
    }
}
