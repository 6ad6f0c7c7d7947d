use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use uuid::Uuid;

use super::rerank::{self, LexicalReranker, Reranker};
use super::RetrievalError;
use crate::config::RetrievalConfig;
use crate::models::*;
use crate::pipeline::storage::{
    call_with_retry, CallPolicy, EmbeddingModel, KnowledgeStore, ProfileStore, StoreError,
};
use crate::pipeline::text::text_similarity;

/// Ranked evidence from both paths plus what went missing.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub evidence: Vec<EvidenceItem>,
    /// Paths that failed; the evidence comes from the others.
    pub degraded_paths: Vec<RetrievalPath>,
    /// The user's profile as read for this request, `None` if the profile path failed.
    pub profile: Option<ProfileRecord>,
}

impl RetrievalOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.degraded_paths.is_empty()
    }
}

/// Weight of an entry `age_days` old: 1 now, 0.5 at one half-life.
pub fn recency_decay(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    (-std::f64::consts::LN_2 * age_days.max(0.0) / half_life_days).exp()
}

/// Score desc, then deviation desc, then newer first (undated last).
/// Provenance id settles anything left so the order is total.
pub fn rank_evidence(items: &mut [EvidenceItem]) {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.deviation.partial_cmp(&a.deviation).unwrap_or(Ordering::Equal))
            .then_with(|| b.recorded_at.cmp(&a.recorded_at))
            .then_with(|| a.provenance_id.cmp(&b.provenance_id))
    });
}

fn format_profile_entry(snapshot: &ProfileSnapshot, past: &Finding, flags: &[&RiskFlag]) -> String {
    let mut text = format!(
        "{} {}: {}",
        snapshot.recorded_at.format("%Y-%m-%d"),
        past.display_name(),
        past.value
    );
    if let Some(unit) = &past.unit {
        text.push(' ');
        text.push_str(unit);
    }
    if let Some(range) = &past.reference_range {
        text.push_str(&format!(" (reference {range})"));
    }
    for flag in flags {
        text.push_str(&format!("; flagged {}: {}", flag.severity, flag.message));
    }
    text
}

/// Queries the knowledge corpus and the user's history concurrently and
/// merges both into one ranked evidence list.
pub struct DualPathRetriever {
    knowledge: Arc<dyn KnowledgeStore>,
    profiles: Arc<dyn ProfileStore>,
    embedder: Arc<dyn EmbeddingModel>,
    reranker: Arc<dyn Reranker>,
    config: RetrievalConfig,
    policy: CallPolicy,
}

impl DualPathRetriever {
    pub fn new(
        knowledge: Arc<dyn KnowledgeStore>,
        profiles: Arc<dyn ProfileStore>,
        embedder: Arc<dyn EmbeddingModel>,
        config: RetrievalConfig,
    ) -> Self {
        let policy = CallPolicy::from_config(&config);
        Self {
            knowledge,
            profiles,
            embedder,
            reranker: Arc::new(LexicalReranker),
            config,
            policy,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub async fn retrieve(
        &self,
        user_id: &str,
        findings: &[Finding],
    ) -> Result<RetrievalOutcome, RetrievalError> {
        self.retrieve_at(user_id, findings, Utc::now()).await
    }

    /// Retrieval with an explicit clock for recency weighting.
    pub async fn retrieve_at(
        &self,
        user_id: &str,
        findings: &[Finding],
        now: DateTime<Utc>,
    ) -> Result<RetrievalOutcome, RetrievalError> {
        let (knowledge, profile) = tokio::join!(
            self.knowledge_path(findings),
            self.profile_path(user_id, findings, now)
        );

        let mut evidence = Vec::new();
        let mut degraded_paths = Vec::new();

        let knowledge_error = match knowledge {
            Ok(items) => {
                evidence.extend(items);
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Knowledge path failed, continuing profile-only");
                degraded_paths.push(RetrievalPath::Knowledge);
                Some(e)
            }
        };

        let (profile_error, record) = match profile {
            Ok((items, record)) => {
                evidence.extend(items);
                (None, Some(record))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Profile path failed, continuing knowledge-only");
                degraded_paths.push(RetrievalPath::Profile);
                (Some(e), None)
            }
        };

        if let (Some(k), Some(p)) = (&knowledge_error, &profile_error) {
            tracing::error!("Both retrieval paths unavailable");
            return Err(RetrievalError::Unavailable {
                knowledge: k.to_string(),
                profile: p.to_string(),
            });
        }

        rank_evidence(&mut evidence);

        tracing::debug!(
            findings = findings.len(),
            evidence = evidence.len(),
            degraded = !degraded_paths.is_empty(),
            "Dual-path retrieval complete"
        );

        Ok(RetrievalOutcome {
            evidence,
            degraded_paths,
            profile: record,
        })
    }

    async fn search_for_finding(&self, finding: &Finding) -> Result<Vec<KnowledgeHit>, StoreError> {
        let description = finding.description();
        let text = description.as_str();
        let embedder = &self.embedder;
        let embedding = call_with_retry(&self.policy, "embed_finding", move || async move {
            embedder.embed(text).await.map_err(StoreError::from)
        })
        .await?;

        let store = &self.knowledge;
        let query = embedding.as_slice();
        let top_k = self.config.knowledge_top_k;
        let hits = call_with_retry(&self.policy, "knowledge_search", move || async move {
            store.search(query, top_k).await
        })
        .await?;

        Ok(self.rerank(text, hits).await)
    }

    /// Reorder and cut hits by relevance to the finding. A failing reranker
    /// leaves the vector hits as they are.
    async fn rerank(&self, query: &str, hits: Vec<KnowledgeHit>) -> Vec<KnowledgeHit> {
        if hits.is_empty() {
            return hits;
        }
        let fallback = hits.clone();
        let scored = match tokio::time::timeout(self.policy.timeout, self.reranker.score(query, hits)).await {
            Ok(Ok(scored)) => scored,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Reranker failed, keeping vector order");
                return fallback;
            }
            Err(_) => {
                tracing::warn!("Reranker timed out, keeping vector order");
                return fallback;
            }
        };

        let candidates = scored.len();
        let kept = rerank::select(scored, self.config.rerank_threshold, self.config.rerank_top_k);
        tracing::debug!(candidates, kept = kept.len(), "Knowledge hits reranked");
        kept.into_iter().map(|r| r.hit).collect()
    }

    async fn knowledge_path(&self, findings: &[Finding]) -> Result<Vec<EvidenceItem>, StoreError> {
        let results = join_all(findings.iter().map(|f| self.search_for_finding(f))).await;

        // Same chunk hit by several findings keeps its best score.
        let mut by_chunk: HashMap<Uuid, EvidenceItem> = HashMap::new();
        for (finding, result) in findings.iter().zip(results) {
            let hits = result?;
            let metric = finding.metric_key();
            let deviation = finding.deviation();

            for hit in hits {
                let score = f64::from(hit.score).max(0.0);
                match by_chunk.get_mut(&hit.chunk.id) {
                    Some(item) => {
                        item.score = item.score.max(score);
                        item.deviation = item.deviation.max(deviation);
                        if !item.metrics.contains(&metric) {
                            item.metrics.push(metric.clone());
                        }
                    }
                    None => {
                        by_chunk.insert(
                            hit.chunk.id,
                            EvidenceItem {
                                origin: EvidenceOrigin::Knowledge,
                                provenance_id: hit.chunk.provenance_tag(),
                                content: hit.chunk.text,
                                score,
                                deviation,
                                recorded_at: None,
                                metrics: vec![metric.clone()],
                            },
                        );
                    }
                }
            }
        }

        Ok(by_chunk
            .into_values()
            .map(|mut item| {
                item.score *= self.config.knowledge_weight;
                item
            })
            .collect())
    }

    async fn profile_path(
        &self,
        user_id: &str,
        findings: &[Finding],
        now: DateTime<Utc>,
    ) -> Result<(Vec<EvidenceItem>, ProfileRecord), StoreError> {
        let store = &self.profiles;
        let record = call_with_retry(&self.policy, "profile_load", move || async move {
            store.load(user_id).await
        })
        .await?;

        let current: HashMap<String, &Finding> =
            findings.iter().map(|f| (f.metric_key(), f)).collect();
        let descriptions: HashMap<&str, String> = current
            .iter()
            .map(|(key, f)| (key.as_str(), f.description()))
            .collect();

        let mut items = Vec::new();
        for snapshot in &record.history {
            let age_days = (now - snapshot.recorded_at).num_seconds() as f64 / 86_400.0;
            let decay = recency_decay(age_days, self.config.recency_half_life_days);

            for past in &snapshot.findings {
                let key = past.metric_key();
                let Some(description) = descriptions.get(key.as_str()) else {
                    continue;
                };
                let similarity = text_similarity(description, &past.description());
                let flags: Vec<&RiskFlag> = snapshot
                    .flags
                    .iter()
                    .filter(|flag| flag.finding_id == past.id)
                    .collect();

                items.push(EvidenceItem {
                    origin: EvidenceOrigin::Profile,
                    content: format_profile_entry(snapshot, past, &flags),
                    score: self.config.profile_weight * similarity * decay,
                    provenance_id: snapshot.provenance_tag(&key),
                    deviation: past.deviation(),
                    recorded_at: Some(snapshot.recorded_at),
                    metrics: vec![key],
                });
            }
        }

        rank_evidence(&mut items);
        items.truncate(self.config.profile_top_k);
        Ok((items, record))
    }
}
