pub mod config;
pub mod models;
pub mod db;
pub mod pipeline; // Retrieval, context assembly, risk guard, profile updates
pub mod analyzer; // analyze() / sync_profile() entry points

pub use analyzer::{AnalysisError, AnalysisResponse, CheckupAnalyzer};
pub use config::AnalysisConfig;
pub use models::{Finding, KnowledgeChunk, ProfileRecord, RiskFlag};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the crate default. Safe to call more than once:
/// later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();

    tracing::info!("CheckupAI core v{}", config::APP_VERSION);
}
