//! Request entry points: `analyze` runs one checkup report through retrieval,
//! generation and the risk guard; `sync_profile` flushes staged findings
//! into the user's longitudinal profile.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::{AnalysisConfig, ConfigError, ContradictionPolicy};
use crate::models::*;
use crate::pipeline::profile::{ProfileError, ProfileUpdater, SyncAck};
use crate::pipeline::rag::prompt::{build_analysis_prompt, fallback_analysis, ANALYSIS_SYSTEM_PROMPT};
use crate::pipeline::rag::{
    ContextAssembler, DualPathRetriever, GenerationError, LlmGenerate, OllamaGenerator,
    RetrievalError,
};
use crate::pipeline::safety::{
    append_consult_notice, assess, RiskGuard, RuleError, RuleRegistry, RuleWatcher,
    SecondaryValidator,
};
use crate::pipeline::storage::{
    CallPolicy, EmbeddingError, EmbeddingModel, HashingEmbedder, KnowledgeStore, OllamaEmbedder,
    ProfileStore, SqliteKnowledgeStore, SqliteProfileStore, StoreError,
};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("User id is empty")]
    EmptyUserId,

    #[error("No findings to analyze")]
    NoFindings,

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("Profile update failed: {0}")]
    Profile(#[from] ProfileError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rule set error: {0}")]
    Rules(#[from] RuleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Embedder setup failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Generator setup failed: {0}")]
    Generation(#[from] GenerationError),
}

/// Result of one `analyze` call.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResponse {
    pub analysis_text: String,
    /// Deterministic flags, contraindication flags and secondary review
    /// flags. Every flag refers to a finding of this request.
    pub risk_flags: Vec<RiskFlag>,
    /// Provenance ids of the context the model was given.
    pub provenance: Vec<String>,
    pub degraded: bool,
    pub degraded_paths: Vec<RetrievalPath>,
    pub validation_failed: bool,
    pub risk_assessment: RiskAssessment,
    /// The model could not be reached; `analysis_text` is the deterministic
    /// summary of the flags.
    pub generation_failed: bool,
    pub regenerations: usize,
    /// Whether this request's snapshot reached the profile store. When
    /// false the snapshot stays staged for `sync_profile`.
    pub profile_persisted: bool,
}

pub struct CheckupAnalyzer {
    retriever: DualPathRetriever,
    assembler: ContextAssembler,
    llm: Arc<dyn LlmGenerate>,
    guard: RiskGuard,
    updater: Arc<ProfileUpdater>,
    config: AnalysisConfig,
    rule_watcher: Option<RuleWatcher>,
}

impl CheckupAnalyzer {
    pub fn new(
        config: AnalysisConfig,
        knowledge: Arc<dyn KnowledgeStore>,
        profiles: Arc<dyn ProfileStore>,
        embedder: Arc<dyn EmbeddingModel>,
        llm: Arc<dyn LlmGenerate>,
        rules: Arc<RuleRegistry>,
    ) -> Self {
        let policy = CallPolicy::from_config(&config.retrieval);
        let updater = ProfileUpdater::new(Arc::clone(&profiles), &config.profile, policy);
        Self {
            retriever: DualPathRetriever::new(knowledge, profiles, embedder, config.retrieval.clone()),
            assembler: ContextAssembler::new(&config.context),
            llm,
            guard: RiskGuard::new(rules),
            updater: Arc::new(updater),
            config,
            rule_watcher: None,
        }
    }

    /// Production wiring: SQLite stores at `db_path`, Ollama generation and
    /// the configured rule file.
    pub fn open(config: AnalysisConfig, db_path: &Path) -> Result<Self, AnalysisError> {
        config.validate()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::from)?;
        }

        let knowledge = Arc::new(SqliteKnowledgeStore::open(db_path)?);
        let profiles = Arc::new(SqliteProfileStore::open(db_path)?);
        let generation = &config.generation;
        let embedder: Arc<dyn EmbeddingModel> = match &generation.embedding_model {
            Some(model) => Arc::new(OllamaEmbedder::new(
                &generation.ollama_url,
                model,
                generation.embedding_dimension,
                config.retrieval.call_timeout(),
            )?),
            None => Arc::new(HashingEmbedder::new(generation.embedding_dimension)),
        };
        let llm = Arc::new(OllamaGenerator::from_config(generation)?);
        let rules = Arc::new(RuleRegistry::from_config(&config.guard)?);
        let rule_watcher = Self::watch_rules(&rules, &config);

        tracing::info!(
            db = %db_path.display(),
            model = %generation.model,
            rules = rules.path().map(|p| p.display().to_string()).unwrap_or_else(|| "builtin".into()),
            "Checkup analyzer ready"
        );
        let mut analyzer = Self::new(config, knowledge, profiles, embedder, llm, rules);
        analyzer.rule_watcher = rule_watcher;
        Ok(analyzer)
    }

    /// Reload a file-backed rule set on the configured interval. The watcher
    /// stops when the analyzer is dropped.
    fn watch_rules(rules: &Arc<RuleRegistry>, config: &AnalysisConfig) -> Option<RuleWatcher> {
        rules.path()?;
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("No async runtime, rule file will not be reloaded");
            return None;
        }
        Some(rules.spawn_watcher(config.guard.reload_interval()))
    }

    /// Whether a background task is reloading the rule file.
    pub fn is_watching_rules(&self) -> bool {
        self.rule_watcher.is_some()
    }

    pub fn with_secondary_validator(mut self, validator: Arc<dyn SecondaryValidator>) -> Self {
        self.guard = self.guard.with_secondary_validator(validator);
        self
    }

    pub fn guard(&self) -> &RiskGuard {
        &self.guard
    }

    pub fn updater(&self) -> &Arc<ProfileUpdater> {
        &self.updater
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyze one report's findings for `user_id`.
    ///
    /// Fails only on invalid input or when both retrieval paths are down.
    /// Generation and profile write failures degrade the response instead.
    pub async fn analyze(
        &self,
        user_id: &str,
        findings: &[Finding],
    ) -> Result<AnalysisResponse, AnalysisError> {
        if user_id.trim().is_empty() {
            return Err(AnalysisError::EmptyUserId);
        }
        if findings.is_empty() {
            return Err(AnalysisError::NoFindings);
        }

        // One rule snapshot for the whole request, even across a reload.
        let rules = self.guard.rules();
        let pre_flags = rules.evaluate(findings);
        tracing::debug!(user_id, findings = findings.len(), flags = pre_flags.len(), "Rules evaluated");

        let retrieval = self.retriever.retrieve(user_id, findings).await?;
        let context = self.assembler.assemble(&retrieval.evidence);
        let profile_tags = retrieval.profile.as_ref().map(|p| &p.derived_tags);
        let history = retrieval.profile.as_ref().map_or(&[][..], |p| p.history.as_slice());

        let mut conditions: BTreeSet<String> = profile_tags
            .map(|tags| tags.conditions.clone())
            .unwrap_or_default();
        conditions.extend(pre_flags.iter().filter_map(|f| f.condition.clone()));

        let mut correction: Option<String> = None;
        let mut regenerations = 0;
        let mut saw_contradiction = false;
        let (report, generation_failed) = loop {
            let prompt = build_analysis_prompt(
                findings,
                &pre_flags,
                &context,
                profile_tags,
                correction.as_deref(),
            );
            let (text, generation_failed) = match self.generate(&prompt).await {
                Ok(text) => (text, false),
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "Generation failed, using rule summary");
                    (fallback_analysis(findings, &pre_flags), true)
                }
            };

            let report = rules.validate_with_history(&text, findings, &pre_flags, &conditions, history);
            saw_contradiction |= report.has_contradictions();

            let regenerate = report.has_contradictions()
                && !generation_failed
                && self.config.guard.contradiction_policy == ContradictionPolicy::Regenerate
                && regenerations < self.config.guard.max_regenerations;
            if !regenerate {
                break (report, generation_failed);
            }
            regenerations += 1;
            tracing::info!(
                user_id,
                attempt = regenerations,
                contradictions = report.contradictions.len(),
                "Draft contradicts findings, regenerating"
            );
            correction = Some(report.correction_summary());
        };

        let validation_failed = report.validation_failed || saw_contradiction;

        let mut flags = pre_flags;
        flags.extend(report.added_flags);
        let text = if report.text.trim().is_empty() {
            fallback_analysis(findings, &flags)
        } else {
            report.text
        };
        let secondary = self.guard.secondary_review(findings, &flags, &text).await;
        flags.extend(secondary);

        let analysis_text = append_consult_notice(&text, &flags);
        let risk_assessment = assess(&flags);
        let profile_persisted = self.persist(user_id, findings, &flags).await;

        tracing::info!(
            user_id,
            flags = flags.len(),
            overall = %risk_assessment.overall,
            degraded = retrieval.is_degraded(),
            validation_failed,
            generation_failed,
            "Analysis complete"
        );

        Ok(AnalysisResponse {
            analysis_text,
            provenance: context.provenance(),
            degraded: retrieval.is_degraded(),
            degraded_paths: retrieval.degraded_paths,
            risk_flags: flags,
            validation_failed,
            risk_assessment,
            generation_failed,
            regenerations,
            profile_persisted,
        })
    }

    /// Write any staged findings for `user_id` and return the refreshed
    /// derived tags. Safe to call repeatedly.
    pub async fn sync_profile(&self, user_id: &str) -> Result<SyncAck, AnalysisError> {
        if user_id.trim().is_empty() {
            return Err(AnalysisError::EmptyUserId);
        }
        Ok(self.updater.flush(user_id).await?)
    }

    /// Batch sync of every known user, for scheduled maintenance runs.
    pub async fn sync_all_profiles(&self) -> Result<Vec<SyncAck>, AnalysisError> {
        Ok(self.updater.sync_all().await?)
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let timeout = self.config.generation.timeout();
        match tokio::time::timeout(timeout, self.llm.generate(ANALYSIS_SYSTEM_PROMPT, prompt)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(timeout)),
        }
    }

    /// Record this request's snapshot. The write runs on its own task so it
    /// completes even if the caller stops waiting.
    async fn persist(&self, user_id: &str, findings: &[Finding], flags: &[RiskFlag]) -> bool {
        if !self.config.profile.persist_on_analyze {
            self.updater.stage(user_id, findings.to_vec(), flags.to_vec());
            return false;
        }

        let updater = Arc::clone(&self.updater);
        let user = user_id.to_string();
        let findings = findings.to_vec();
        let flags = flags.to_vec();
        let task = tokio::spawn(async move { updater.record(&user, findings, flags).await });

        match task.await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(user_id, error = %e, "Profile write failed, snapshot left pending");
                false
            }
            Err(e) => {
                tracing::error!(user_id, error = %e, "Profile write task failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::rag::generation::mock::ScriptedLlm;
    use crate::pipeline::safety::{LlmSecondaryValidator, CONSULT_NOTICE, SECONDARY_REVIEW_RULE};
    use crate::pipeline::storage::knowledge_builder::KnowledgeBaseBuilder;
    use crate::pipeline::storage::{AppendOutcome, InMemoryKnowledgeStore, InMemoryProfileStore};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    struct UnreachableKnowledge;

    #[async_trait]
    impl KnowledgeStore for UnreachableKnowledge {
        async fn search(&self, _q: &[f32], _k: usize) -> Result<Vec<KnowledgeHit>, StoreError> {
            Err(StoreError::Unavailable("vector index offline".into()))
        }
        async fn insert(&self, _c: Vec<KnowledgeChunk>) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("vector index offline".into()))
        }
        async fn count(&self) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("vector index offline".into()))
        }
    }

    struct UnreachableProfiles;

    #[async_trait]
    impl ProfileStore for UnreachableProfiles {
        async fn load(&self, _u: &str) -> Result<ProfileRecord, StoreError> {
            Err(StoreError::Unavailable("profile db offline".into()))
        }
        async fn append_snapshot(&self, _s: &ProfileSnapshot) -> Result<AppendOutcome, StoreError> {
            Err(StoreError::Unavailable("profile db offline".into()))
        }
        async fn save_derived_tags(&self, _u: &str, _t: &DerivedRiskTags) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("profile db offline".into()))
        }
        async fn list_users(&self) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("profile db offline".into()))
        }
    }

    const GUIDE: &str = "Blood pressure at or above 140/90 mmHg indicates hypertension. \
        Repeated readings and lifestyle changes such as reducing salt are recommended.\n\n\
        Fasting glucose above 6.1 mmol/L suggests impaired glucose regulation.";

    const CLEAN_DRAFT: &str = "Blood pressure 140/90 mmHg is at the hypertension threshold. \
        Please arrange repeated readings with your doctor.";

    fn fast_config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.retrieval.call_timeout_ms = 200;
        config.retrieval.max_retries = 1;
        config.retrieval.retry_backoff_ms = 1;
        config.generation.timeout_secs = 5;
        config
    }

    async fn knowledge() -> Arc<dyn KnowledgeStore> {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        KnowledgeBaseBuilder::new(Arc::new(HashingEmbedder::default()), store.clone())
            .add_document("hypertension_guide.md", GUIDE)
            .await
            .unwrap();
        store
    }

    fn analyzer_with(
        config: AnalysisConfig,
        knowledge: Arc<dyn KnowledgeStore>,
        profiles: Arc<dyn ProfileStore>,
        llm: Arc<ScriptedLlm>,
    ) -> CheckupAnalyzer {
        CheckupAnalyzer::new(
            config,
            knowledge,
            profiles,
            Arc::new(HashingEmbedder::default()),
            llm,
            Arc::new(RuleRegistry::builtin().unwrap()),
        )
    }

    fn bp() -> Finding {
        Finding::new("blood_pressure", "140/90")
            .with_unit("mmHg")
            .with_reference_range("<120/80")
    }

    fn report_findings() -> Vec<Finding> {
        vec![
            bp(),
            Finding::new("fasting_glucose", "5.0")
                .with_unit("mmol/L")
                .with_reference_range("3.9-6.1"),
        ]
    }

    #[tokio::test]
    async fn hypertension_threshold_yields_critical_flag_and_notice() {
        let profiles = Arc::new(InMemoryProfileStore::new());
        let llm = Arc::new(ScriptedLlm::new(&[CLEAN_DRAFT]));
        let analyzer = analyzer_with(fast_config(), knowledge().await, profiles.clone(), llm.clone());
        let findings = report_findings();

        let response = analyzer.analyze("u1", &findings).await.unwrap();

        let critical: Vec<&RiskFlag> = response
            .risk_flags
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].finding_id, findings[0].id);
        assert_eq!(critical[0].rule_id, "hypertension_threshold");
        assert!(response.analysis_text.starts_with(CLEAN_DRAFT));
        assert!(response.analysis_text.ends_with(CONSULT_NOTICE));
        assert_eq!(response.risk_assessment.overall, OverallRisk::High);
        assert!(!response.degraded);
        assert!(!response.validation_failed);
        assert!(!response.generation_failed);
        assert!(response
            .provenance
            .iter()
            .any(|p| p.starts_with("knowledge:hypertension_guide.md")));

        assert!(response.profile_persisted);
        let record = profiles.load("u1").await.unwrap();
        assert_eq!(record.history.len(), 1);
        assert!(record.derived_tags.conditions.contains("hypertension"));

        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("<RISK_FLAGS>"));
        assert!(prompt.contains("hypertension_threshold"));
    }

    #[tokio::test]
    async fn every_flag_refers_to_a_request_finding() {
        let llm = Arc::new(ScriptedLlm::new(&[
            "Blood pressure 140/90 mmHg is high. A high salt diet is fine for you.",
        ]));
        let analyzer = analyzer_with(
            fast_config(),
            knowledge().await,
            Arc::new(InMemoryProfileStore::new()),
            llm,
        );
        let findings = vec![
            bp(),
            Finding::new("ALT", "55").with_unit("U/L"),
            Finding::new("eGFR", "52"),
            Finding::new("tsh", "2.1").with_reference_range("0.4-4.0"),
        ];

        let response = analyzer.analyze("u1", &findings).await.unwrap();
        assert!(!response.risk_flags.is_empty());
        for flag in &response.risk_flags {
            assert!(findings.iter().any(|f| f.id == flag.finding_id), "orphan flag {flag:?}");
        }
    }

    #[tokio::test]
    async fn knowledge_outage_still_uses_profile_context() {
        let profiles = Arc::new(InMemoryProfileStore::new());
        profiles
            .append_snapshot(&ProfileSnapshot {
                id: uuid::Uuid::new_v4(),
                user_id: "u1".into(),
                recorded_at: Utc::now() - Duration::days(60),
                findings: vec![Finding::new("blood_pressure", "135/85").with_unit("mmHg")],
                flags: vec![],
            })
            .await
            .unwrap();

        let analyzer = analyzer_with(
            fast_config(),
            Arc::new(UnreachableKnowledge),
            profiles,
            Arc::new(ScriptedLlm::new(&[CLEAN_DRAFT])),
        );
        let response = analyzer.analyze("u1", &[bp()]).await.unwrap();

        assert!(response.degraded);
        assert_eq!(response.degraded_paths, vec![RetrievalPath::Knowledge]);
        assert!(!response.provenance.is_empty());
        assert!(response.provenance.iter().all(|p| p.starts_with("profile:")));
        assert!(response.analysis_text.ends_with(CONSULT_NOTICE));
    }

    #[tokio::test]
    async fn both_paths_down_is_an_error() {
        let analyzer = analyzer_with(
            fast_config(),
            Arc::new(UnreachableKnowledge),
            Arc::new(UnreachableProfiles),
            Arc::new(ScriptedLlm::new(&[CLEAN_DRAFT])),
        );
        let err = analyzer.analyze("u1", &[bp()]).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Retrieval(RetrievalError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let analyzer = analyzer_with(
            fast_config(),
            knowledge().await,
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(ScriptedLlm::new(&[CLEAN_DRAFT])),
        );
        assert!(matches!(analyzer.analyze("u1", &[]).await, Err(AnalysisError::NoFindings)));
        assert!(matches!(analyzer.analyze("  ", &[bp()]).await, Err(AnalysisError::EmptyUserId)));
        assert!(matches!(analyzer.sync_profile("").await, Err(AnalysisError::EmptyUserId)));
    }

    #[tokio::test]
    async fn contradiction_is_redacted_by_default() {
        let llm = Arc::new(ScriptedLlm::new(&[
            "Your blood pressure is normal. Your fasting glucose of 5.0 mmol/L is within range.",
        ]));
        let analyzer = analyzer_with(
            fast_config(),
            knowledge().await,
            Arc::new(InMemoryProfileStore::new()),
            llm.clone(),
        );

        let response = analyzer.analyze("u1", &report_findings()).await.unwrap();
        assert!(response.validation_failed);
        assert_eq!(response.regenerations, 0);
        assert_eq!(llm.calls(), 1);
        assert!(!response.analysis_text.contains("blood pressure is normal"));
        assert!(response.analysis_text.starts_with("Your fasting glucose of 5.0 mmol/L is within range."));
        assert!(response.analysis_text.ends_with(CONSULT_NOTICE));
    }

    #[tokio::test]
    async fn regenerate_policy_retries_with_correction() {
        let mut config = fast_config();
        config.guard.contradiction_policy = ContradictionPolicy::Regenerate;
        let llm = Arc::new(ScriptedLlm::new(&["Your blood pressure is normal.", CLEAN_DRAFT]));
        let analyzer = analyzer_with(
            config,
            knowledge().await,
            Arc::new(InMemoryProfileStore::new()),
            llm.clone(),
        );

        let response = analyzer.analyze("u1", &report_findings()).await.unwrap();
        assert_eq!(llm.calls(), 2);
        assert_eq!(response.regenerations, 1);
        assert!(response.validation_failed);
        assert!(response.analysis_text.starts_with(CLEAN_DRAFT));

        let prompts = llm.prompts.lock().unwrap();
        assert!(!prompts[0].contains("<CORRECTION>"));
        assert!(prompts[1].contains("<CORRECTION>"));
        assert!(prompts[1].contains("Your blood pressure is normal."));
    }

    #[tokio::test]
    async fn regeneration_budget_falls_back_to_redaction() {
        let mut config = fast_config();
        config.guard.contradiction_policy = ContradictionPolicy::Regenerate;
        config.guard.max_regenerations = 2;
        let llm = Arc::new(ScriptedLlm::new(&["Your blood pressure is normal."]));
        let analyzer = analyzer_with(
            config,
            knowledge().await,
            Arc::new(InMemoryProfileStore::new()),
            llm.clone(),
        );

        let findings = report_findings();
        let response = analyzer.analyze("u1", &findings).await.unwrap();
        assert_eq!(llm.calls(), 3);
        assert_eq!(response.regenerations, 2);
        assert!(response.validation_failed);
        // Everything was redacted, so the rule summary stands in.
        assert!(response.analysis_text.starts_with("The following findings need attention:"));
        assert!(response.analysis_text.ends_with(CONSULT_NOTICE));
    }

    #[tokio::test]
    async fn generation_failure_falls_back_to_rule_summary() {
        let profiles = Arc::new(InMemoryProfileStore::new());
        let analyzer = analyzer_with(
            fast_config(),
            knowledge().await,
            profiles.clone(),
            Arc::new(ScriptedLlm::failing()),
        );

        let response = analyzer.analyze("u1", &report_findings()).await.unwrap();
        assert!(response.generation_failed);
        assert!(response.analysis_text.contains("hypertension threshold"));
        assert!(response.analysis_text.ends_with(CONSULT_NOTICE));
        assert_eq!(response.risk_assessment.overall, OverallRisk::High);
        assert!(response.profile_persisted);
        assert_eq!(profiles.load("u1").await.unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn dangerous_advice_never_reaches_the_user() {
        let llm = Arc::new(ScriptedLlm::new(&[
            "Blood pressure 140/90 mmHg is high. You can stop taking your medication.",
        ]));
        let analyzer = analyzer_with(
            fast_config(),
            knowledge().await,
            Arc::new(InMemoryProfileStore::new()),
            llm,
        );
        let response = analyzer.analyze("u1", &[bp()]).await.unwrap();
        assert!(response.validation_failed);
        assert!(!response.analysis_text.contains("medication"));
        assert!(response.analysis_text.starts_with("Blood pressure 140/90 mmHg is high."));
    }

    #[tokio::test]
    async fn secondary_review_adds_informational_flags() {
        let llm = Arc::new(ScriptedLlm::new(&[CLEAN_DRAFT]));
        let reviewer = Arc::new(ScriptedLlm::new(&[
            r#"{"suspicious": [{"metric": "tsh", "reason": "near upper limit"}]}"#,
        ]));
        let analyzer = analyzer_with(
            fast_config(),
            knowledge().await,
            Arc::new(InMemoryProfileStore::new()),
            llm,
        )
        .with_secondary_validator(Arc::new(LlmSecondaryValidator::new(reviewer)));

        let findings = vec![bp(), Finding::new("tsh", "3.9").with_reference_range("0.4-4.0")];
        let response = analyzer.analyze("u1", &findings).await.unwrap();
        let review: Vec<&RiskFlag> = response
            .risk_flags
            .iter()
            .filter(|f| f.rule_id == SECONDARY_REVIEW_RULE)
            .collect();
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].finding_id, findings[1].id);
        assert_eq!(review[0].severity, Severity::Informational);
    }

    #[tokio::test]
    async fn staged_findings_are_written_by_sync_profile() {
        let mut config = fast_config();
        config.profile.persist_on_analyze = false;
        let profiles = Arc::new(InMemoryProfileStore::new());
        let analyzer = analyzer_with(
            config,
            knowledge().await,
            profiles.clone(),
            Arc::new(ScriptedLlm::new(&[CLEAN_DRAFT])),
        );

        let response = analyzer.analyze("u1", &[bp()]).await.unwrap();
        assert!(!response.profile_persisted);
        assert!(profiles.load("u1").await.unwrap().history.is_empty());
        assert_eq!(analyzer.updater().pending_count("u1"), 1);

        let first = analyzer.sync_profile("u1").await.unwrap();
        assert_eq!(first.appended, 1);
        assert_eq!(first.total_snapshots, 1);
        assert_eq!(first.derived_tags.highest_recent, Some(Severity::Critical));

        let second = analyzer.sync_profile("u1").await.unwrap();
        assert_eq!(second.appended, 0);
        assert_eq!(second.total_snapshots, 1);
        assert_eq!(first.derived_tags, second.derived_tags);
    }

    #[tokio::test]
    async fn trend_against_stored_history_is_kept() {
        let profiles = Arc::new(InMemoryProfileStore::new());
        profiles
            .append_snapshot(&ProfileSnapshot {
                id: uuid::Uuid::new_v4(),
                user_id: "u1".into(),
                recorded_at: Utc::now() - Duration::days(365),
                findings: vec![Finding::new("blood_pressure", "135/88").with_unit("mmHg")],
                flags: vec![],
            })
            .await
            .unwrap();
        let draft = "Your blood pressure was 135/88 last year and is 140/90 now.";
        let analyzer = analyzer_with(
            fast_config(),
            knowledge().await,
            profiles,
            Arc::new(ScriptedLlm::new(&[draft])),
        );

        let response = analyzer.analyze("u1", &[bp()]).await.unwrap();
        assert!(!response.validation_failed);
        assert!(response.analysis_text.starts_with(draft));
    }

    #[tokio::test]
    async fn batch_sync_writes_every_staged_user() {
        let mut config = fast_config();
        config.profile.persist_on_analyze = false;
        let profiles = Arc::new(InMemoryProfileStore::new());
        let analyzer = analyzer_with(
            config,
            knowledge().await,
            profiles.clone(),
            Arc::new(ScriptedLlm::new(&[CLEAN_DRAFT])),
        );
        analyzer.analyze("u1", &[bp()]).await.unwrap();
        analyzer.analyze("u2", &report_findings()).await.unwrap();

        let acks = analyzer.sync_all_profiles().await.unwrap();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|a| a.appended == 1 && a.tags_saved));
        assert_eq!(profiles.list_users().await.unwrap(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn concurrent_requests_keep_history_ordered() {
        let profiles = Arc::new(InMemoryProfileStore::new());
        let analyzer = Arc::new(analyzer_with(
            fast_config(),
            knowledge().await,
            profiles.clone(),
            Arc::new(ScriptedLlm::new(&[CLEAN_DRAFT])),
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let analyzer = Arc::clone(&analyzer);
                tokio::spawn(async move { analyzer.analyze("u1", &[bp()]).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap().profile_persisted);
        }

        let record = profiles.load("u1").await.unwrap();
        assert_eq!(record.history.len(), 8);
        assert!(record
            .history
            .windows(2)
            .all(|w| w[0].recorded_at <= w[1].recorded_at));
    }

    #[tokio::test]
    async fn open_wires_sqlite_stores() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("checkupai.db");
        let analyzer = CheckupAnalyzer::open(AnalysisConfig::default(), &db_path).unwrap();

        assert!(db_path.exists());
        let ack = analyzer.sync_profile("u1").await.unwrap();
        assert_eq!(ack.appended, 0);
        assert_eq!(ack.total_snapshots, 0);
        assert!(!analyzer.is_watching_rules());
    }

    fn alt_rules(version: &str, severity: &str) -> String {
        format!(
            r#"{{"version": "{version}", "rules": {{"alt": [
                {{"id": "elevated_alt", "high": 40, "inclusive": false, "severity": "{severity}", "message": "ALT {{value}}"}}
            ]}}}}"#
        )
    }

    #[tokio::test]
    async fn open_reloads_edited_rule_file() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("rules.json");
        std::fs::write(&rules_path, alt_rules("1", "warning")).unwrap();

        let mut config = AnalysisConfig::default();
        config.guard.rules_path = Some(rules_path.clone());
        config.guard.reload_interval_secs = 1;
        let analyzer = CheckupAnalyzer::open(config, &dir.path().join("db.sqlite")).unwrap();
        assert!(analyzer.is_watching_rules());
        assert_eq!(analyzer.guard().rules().version, "1");

        std::fs::write(&rules_path, alt_rules("2", "critical")).unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&rules_path).unwrap();
        file.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(5))
            .unwrap();
        drop(file);

        let mut reloaded = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            if analyzer.guard().rules().version == "2" {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded);
        let flags = analyzer.guard().rules().evaluate(&[Finding::new("ALT", "50")]);
        assert_eq!(flags[0].severity, Severity::Critical);
    }

    #[test]
    fn open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AnalysisConfig::default();
        config.context.max_tokens = 0;
        let result = CheckupAnalyzer::open(config, &dir.path().join("db.sqlite"));
        assert!(matches!(result, Err(AnalysisError::Config(_))));
    }
}
