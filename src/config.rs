//! Application constants and the analysis configuration.
//!
//! `AnalysisConfig` is read from a JSON file (every field optional, missing
//! fields take defaults), then overridden by `CHECKUPAI_*` environment
//! variables, then validated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "CheckupAI";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CHECKUPAI_";

/// Default `EnvFilter` directive when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "info,checkupai_lib=debug"
}

/// Get the application data directory
/// ~/CheckupAI/ on all platforms. Falls back to the working directory
/// when no home directory can be determined.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// SQLite file holding profile history and the knowledge index.
pub fn database_path() -> PathBuf {
    app_data_dir().join("checkupai.db")
}

/// Default location of the hot-reloadable risk rule set.
pub fn rules_path() -> PathBuf {
    app_data_dir().join("risk_rules.json")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What the guard does with a sentence that contradicts a known finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContradictionPolicy {
    /// Strip the contradicting sentence from the analysis.
    Redact,
    /// Ask the model for a new draft; falls back to `Redact` once attempts run out.
    Regenerate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Nearest-neighbour hits per finding.
    pub knowledge_top_k: usize,
    /// Maximum profile evidence items per request.
    pub profile_top_k: usize,
    pub knowledge_weight: f64,
    pub profile_weight: f64,
    /// Age at which a profile entry's weight is halved.
    pub recency_half_life_days: f64,
    pub call_timeout_ms: u64,
    /// Retries after the first attempt, transient errors only.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Knowledge hits whose rerank score falls below this are dropped.
    pub rerank_threshold: f64,
    /// Hits kept per finding after reranking; `None` keeps every hit
    /// above the threshold.
    pub rerank_top_k: Option<usize>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            knowledge_top_k: 5,
            profile_top_k: 10,
            knowledge_weight: 0.6,
            profile_weight: 0.4,
            recency_half_life_days: 180.0,
            call_timeout_ms: 2_000,
            max_retries: 2,
            retry_backoff_ms: 100,
            rerank_threshold: 0.0,
            rerank_top_k: None,
        }
    }
}

impl RetrievalConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_tokens: usize,
    /// Content similarity above which two evidence items are merged.
    pub dedup_threshold: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2_000,
            dedup_threshold: 0.92,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Rule file. `None` uses the bundled default rule set.
    pub rules_path: Option<PathBuf>,
    pub contradiction_policy: ContradictionPolicy,
    pub max_regenerations: usize,
    pub reload_interval_secs: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            contradiction_policy: ContradictionPolicy::Redact,
            max_regenerations: 1,
            reload_interval_secs: 30,
        }
    }
}

impl GuardConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Append a snapshot at the end of every `analyze`. When off, findings are
    /// only staged until `sync_profile` is called.
    pub persist_on_analyze: bool,
    /// Number of most recent snapshots summarized in derived tags.
    pub severity_window: usize,
    pub write_retries: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            persist_on_analyze: true,
            severity_window: 5,
            write_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub ollama_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Ollama embedding model. `None` uses the local hashing embedder; the
    /// knowledge index must have been built with the same choice.
    pub embedding_model: Option<String>,
    pub embedding_dimension: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".into(),
            model: "medgemma:4b".into(),
            timeout_secs: 120,
            embedding_model: None,
            embedding_dimension: 256,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub retrieval: RetrievalConfig,
    pub context: ContextConfig,
    pub guard: GuardConfig,
    pub profile: ProfileConfig,
    pub generation: GenerationConfig,
}

impl AnalysisConfig {
    /// Load from a JSON file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Analysis config loaded");
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CHECKUPAI_*` overrides using `lookup` to resolve variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("KNOWLEDGE_TOP_K") {
            self.retrieval.knowledge_top_k = parse_override("KNOWLEDGE_TOP_K", &v)?;
        }
        if let Some(v) = get("PROFILE_TOP_K") {
            self.retrieval.profile_top_k = parse_override("PROFILE_TOP_K", &v)?;
        }
        if let Some(v) = get("KNOWLEDGE_WEIGHT") {
            self.retrieval.knowledge_weight = parse_override("KNOWLEDGE_WEIGHT", &v)?;
        }
        if let Some(v) = get("PROFILE_WEIGHT") {
            self.retrieval.profile_weight = parse_override("PROFILE_WEIGHT", &v)?;
        }
        if let Some(v) = get("RECENCY_HALF_LIFE_DAYS") {
            self.retrieval.recency_half_life_days = parse_override("RECENCY_HALF_LIFE_DAYS", &v)?;
        }
        if let Some(v) = get("CALL_TIMEOUT_MS") {
            self.retrieval.call_timeout_ms = parse_override("CALL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            self.retrieval.max_retries = parse_override("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RERANK_THRESHOLD") {
            self.retrieval.rerank_threshold = parse_override("RERANK_THRESHOLD", &v)?;
        }
        if let Some(v) = get("CONTEXT_MAX_TOKENS") {
            self.context.max_tokens = parse_override("CONTEXT_MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("DEDUP_THRESHOLD") {
            self.context.dedup_threshold = parse_override("DEDUP_THRESHOLD", &v)?;
        }
        if let Some(v) = get("RULES_PATH") {
            self.guard.rules_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("RULES_RELOAD_INTERVAL_SECS") {
            self.guard.reload_interval_secs = parse_override("RULES_RELOAD_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("CONTRADICTION_POLICY") {
            self.guard.contradiction_policy = match v.to_ascii_lowercase().as_str() {
                "redact" => ContradictionPolicy::Redact,
                "regenerate" => ContradictionPolicy::Regenerate,
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        key: format!("{ENV_PREFIX}CONTRADICTION_POLICY"),
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = get("PERSIST_ON_ANALYZE") {
            self.profile.persist_on_analyze = parse_override("PERSIST_ON_ANALYZE", &v)?;
        }
        if let Some(v) = get("OLLAMA_URL") {
            self.generation.ollama_url = v;
        }
        if let Some(v) = get("OLLAMA_MODEL") {
            self.generation.model = v;
        }
        if let Some(v) = get("GENERATION_TIMEOUT_SECS") {
            self.generation.timeout_secs = parse_override("GENERATION_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("EMBEDDING_MODEL") {
            self.generation.embedding_model = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.retrieval;
        if r.knowledge_weight < 0.0 || r.profile_weight < 0.0 {
            return Err(ConfigError::Invalid("retrieval weights must be non-negative".into()));
        }
        if r.knowledge_weight + r.profile_weight <= 0.0 {
            return Err(ConfigError::Invalid("retrieval weights cannot both be zero".into()));
        }
        if r.knowledge_top_k == 0 {
            return Err(ConfigError::Invalid("knowledge_top_k must be at least 1".into()));
        }
        if r.recency_half_life_days <= 0.0 {
            return Err(ConfigError::Invalid("recency_half_life_days must be positive".into()));
        }
        if !(0.0..=1.0).contains(&r.rerank_threshold) {
            return Err(ConfigError::Invalid("retrieval.rerank_threshold must be in [0, 1]".into()));
        }
        if r.rerank_top_k == Some(0) {
            return Err(ConfigError::Invalid("retrieval.rerank_top_k must be at least 1".into()));
        }
        if self.context.max_tokens == 0 {
            return Err(ConfigError::Invalid("context.max_tokens must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.context.dedup_threshold) {
            return Err(ConfigError::Invalid("context.dedup_threshold must be in [0, 1]".into()));
        }
        if self.generation.embedding_dimension == 0 {
            return Err(ConfigError::Invalid("generation.embedding_dimension must be positive".into()));
        }
        if self.guard.reload_interval_secs == 0 {
            return Err(ConfigError::Invalid("guard.reload_interval_secs must be positive".into()));
        }
        if self.profile.severity_window == 0 {
            return Err(ConfigError::Invalid("profile.severity_window must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidOverride {
        key: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with("CheckupAI"));
        assert!(database_path().starts_with(app_data_dir()));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AnalysisConfig::default();
        assert_eq!(config.retrieval.knowledge_top_k, 5);
        assert!((config.retrieval.knowledge_weight - 0.6).abs() < f64::EPSILON);
        assert!((config.retrieval.profile_weight - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.retrieval.max_retries, 2);
        assert_eq!(config.context.max_tokens, 2_000);
        assert!((config.context.dedup_threshold - 0.92).abs() < f64::EPSILON);
        assert_eq!(config.guard.contradiction_policy, ContradictionPolicy::Redact);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"retrieval": {"knowledge_top_k": 8}}"#).unwrap();
        assert_eq!(config.retrieval.knowledge_top_k, 8);
        assert_eq!(config.retrieval.profile_top_k, 10);
        assert_eq!(config.context.max_tokens, 2_000);
    }

    #[test]
    fn policy_deserializes_snake_case() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"guard": {"contradiction_policy": "regenerate"}}"#).unwrap();
        assert_eq!(config.guard.contradiction_policy, ContradictionPolicy::Regenerate);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AnalysisConfig::default();
        config
            .apply_overrides(lookup(&[
                ("CHECKUPAI_KNOWLEDGE_TOP_K", "3"),
                ("CHECKUPAI_KNOWLEDGE_WEIGHT", "0.7"),
                ("CHECKUPAI_CONTRADICTION_POLICY", "Regenerate"),
                ("CHECKUPAI_OLLAMA_MODEL", "llama3"),
            ]))
            .unwrap();
        assert_eq!(config.retrieval.knowledge_top_k, 3);
        assert!((config.retrieval.knowledge_weight - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.guard.contradiction_policy, ContradictionPolicy::Regenerate);
        assert_eq!(config.generation.model, "llama3");
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut config = AnalysisConfig::default();
        let err = config
            .apply_overrides(lookup(&[("CHECKUPAI_KNOWLEDGE_TOP_K", "five")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn zero_weights_fail_validation() {
        let mut config = AnalysisConfig::default();
        config.retrieval.knowledge_weight = 0.0;
        config.retrieval.profile_weight = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_reload_interval_fails_validation() {
        let mut config = AnalysisConfig::default();
        config
            .apply_overrides(lookup(&[("CHECKUPAI_RULES_RELOAD_INTERVAL_SECS", "0")]))
            .unwrap();
        assert!(config.validate().is_err());

        config.guard.reload_interval_secs = 5;
        assert_eq!(config.guard.reload_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rerank_settings_are_validated() {
        let mut config = AnalysisConfig::default();
        config
            .apply_overrides(lookup(&[("CHECKUPAI_RERANK_THRESHOLD", "0.3")]))
            .unwrap();
        assert!((config.retrieval.rerank_threshold - 0.3).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());

        config.retrieval.rerank_top_k = Some(0);
        assert!(config.validate().is_err());
        config.retrieval.rerank_top_k = Some(3);
        config.retrieval.rerank_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"context": {"max_tokens": 512}}"#).unwrap();
        let config = AnalysisConfig::load(&path).unwrap();
        assert_eq!(config.context.max_tokens, 512);
    }

    #[test]
    fn load_missing_file_errors() {
        let err = AnalysisConfig::load(Path::new("/nonexistent/checkupai.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(..)));
    }
}
