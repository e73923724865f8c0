//! Configuration for the retrieval service.
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration. API keys are never read from the file; providers pick them
//! up from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::CallPolicy;
use crate::error::{Capability, Result, RetrievalError};
use crate::stage::{GUARDRAIL, NORMALIZATION, QUERY_REWRITE};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Largest `k` a caller may request.
    pub max_k: usize,

    /// Where the persisted corpus lives.
    pub corpus: CorpusConfig,

    /// Query embedding provider settings.
    pub embedding: EmbeddingConfig,

    /// Generator settings.
    pub generation: GenerationConfig,

    /// Guardrail stage settings.
    pub guardrail: GuardrailConfig,

    /// Per-capability deadlines.
    pub timeouts: TimeoutConfig,

    /// Retry policy for external calls.
    pub retry: RetryPolicy,

    /// Stages for plain search.
    pub search: PipelineConfig,

    /// Stages for therapy search.
    pub therapy: PipelineConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_k: 50,
            corpus: CorpusConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            guardrail: GuardrailConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryPolicy::default(),
            search: PipelineConfig::new([(GUARDRAIL, false), (NORMALIZATION, true)]),
            therapy: PipelineConfig::new([
                (GUARDRAIL, true),
                (NORMALIZATION, true),
                (QUERY_REWRITE, true),
            ]),
        }
    }
}

impl RetrievalConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| RetrievalError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&text)
            .map_err(|e| RetrievalError::Config(format!("{}: {e}", path.display())))
    }

    /// Apply `TRANSLATION_ENABLED`, `GUARDRAILS_ENABLED` and
    /// `GUARDRAILS_FAIL_OPEN` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |key: &str| lookup(key).map(|v| v.trim().eq_ignore_ascii_case("true"));

        if let Some(enabled) = flag("TRANSLATION_ENABLED") {
            self.set_stage_enabled(NORMALIZATION, enabled);
        }
        if let Some(enabled) = flag("GUARDRAILS_ENABLED") {
            self.set_stage_enabled(GUARDRAIL, enabled);
        }
        if let Some(fail_open) = flag("GUARDRAILS_FAIL_OPEN") {
            self.guardrail.fail_open = fail_open;
        }
    }

    /// Toggle `stage` in every pipeline that lists it. Returns whether any
    /// pipeline lists it.
    pub fn set_stage_enabled(&mut self, stage: &str, enabled: bool) -> bool {
        let in_search = self.search.set_enabled(stage, enabled);
        let in_therapy = self.therapy.set_enabled(stage, enabled);
        in_search || in_therapy
    }

    /// Call policy for one capability.
    pub fn call_policy(&self, capability: Capability) -> CallPolicy {
        CallPolicy {
            timeout: self.timeouts.for_capability(capability),
            retry: self.retry,
        }
    }
}

/// Location of the persisted corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// JSON array of records.
    pub metadata_path: Option<PathBuf>,

    /// JSON array of vectors, parallel to the records.
    pub vectors_path: Option<PathBuf>,
}

/// Query embedding provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model name; must match the model that embedded the corpus.
    pub model: Option<String>,

    /// API base URL for OpenAI-compatible servers.
    pub base_url: Option<String>,

    /// Requested output width, for models that support truncation.
    pub dimensions: Option<usize>,

    /// Size of the query embedding cache; 0 disables it.
    pub cache_max_entries: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: None,
            base_url: None,
            dimensions: None,
            cache_max_entries: 1024,
        }
    }
}

/// Generator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Model name.
    pub model: Option<String>,

    /// API base URL override.
    pub base_url: Option<String>,
}

/// Guardrail stage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Minimum trimmed input length, in characters.
    pub min_length: usize,

    /// Let input through when the safety checker errors or times out.
    pub fail_open: bool,

    /// Terms rejected by the built-in keyword checker.
    pub blocked_terms: Vec<String>,

    /// Reason reported when a blocked term matches.
    pub blocked_reason: String,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            min_length: 10,
            fail_open: false,
            blocked_terms: Vec::new(),
            blocked_reason: "Content contains inappropriate language".to_string(),
        }
    }
}

/// Deadlines for external calls, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub embed_ms: u64,
    pub generate_ms: u64,
    pub safety_check_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            embed_ms: 10_000,
            generate_ms: 30_000,
            safety_check_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    /// Deadline for one capability.
    pub fn for_capability(&self, capability: Capability) -> Duration {
        Duration::from_millis(match capability {
            Capability::Embedder => self.embed_ms,
            Capability::Generator => self.generate_ms,
            Capability::SafetyChecker => self.safety_check_ms,
        })
    }
}

/// Bounded retry policy for external calls.
///
/// `max_attempts = 1` means no retries. Only transient failures (timeouts,
/// rate limits, 5xx, network errors) are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each further retry.
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based, so attempt 2 is the
    /// first retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(1u64 << exponent))
    }
}

/// Ordered stage list for one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageEntry>,
}

impl PipelineConfig {
    /// Build from `(name, enabled)` pairs.
    pub fn new<'a>(stages: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        Self {
            stages: stages
                .into_iter()
                .map(|(stage, enabled)| StageEntry {
                    stage: stage.to_string(),
                    enabled,
                })
                .collect(),
        }
    }

    fn set_enabled(&mut self, stage: &str, enabled: bool) -> bool {
        let mut found = false;
        for entry in self.stages.iter_mut().filter(|e| e.stage == stage) {
            entry.enabled = enabled;
            found = true;
        }
        found
    }
}

/// One stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    /// Stage name: `guardrail`, `normalization` or `query_rewrite`.
    pub stage: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(
            RetrievalConfig::from_toml_str("").unwrap(),
            RetrievalConfig::default()
        );
    }

    #[test]
    fn test_parse_full_document() {
        let config = RetrievalConfig::from_toml_str(
            r#"
            max_k = 5

            [corpus]
            metadata_path = "data/metadata.json"
            vectors_path = "data/vectors.json"

            [embedding]
            model = "multi-qa-mpnet-base-dot-v1"
            cache_max_entries = 0

            [guardrail]
            min_length = 4
            fail_open = true
            blocked_terms = ["spam"]

            [timeouts]
            generate_ms = 1500

            [retry]
            max_attempts = 3

            [search]
            stages = [{ stage = "normalization", enabled = false }]

            [therapy]
            stages = [{ stage = "guardrail" }, { stage = "query_rewrite" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.max_k, 5);
        assert_eq!(
            config.corpus.metadata_path,
            Some(PathBuf::from("data/metadata.json"))
        );
        assert_eq!(config.embedding.cache_max_entries, 0);
        assert_eq!(config.guardrail.min_length, 4);
        assert!(config.guardrail.fail_open);
        assert_eq!(
            config.guardrail.blocked_reason,
            "Content contains inappropriate language"
        );
        assert_eq!(config.timeouts.generate_ms, 1500);
        assert_eq!(config.timeouts.embed_ms, 10_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.search, PipelineConfig::new([(NORMALIZATION, false)]));
        assert_eq!(
            config.therapy,
            PipelineConfig::new([(GUARDRAIL, true), (QUERY_REWRITE, true)])
        );
    }

    #[test]
    fn test_unparseable_document_is_config_error() {
        let err = RetrievalConfig::from_toml_str("max_k = \"many\"").unwrap_err();
        assert!(matches!(err, RetrievalError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TRANSLATION_ENABLED", "false"),
            ("GUARDRAILS_ENABLED", "TRUE"),
            ("GUARDRAILS_FAIL_OPEN", "true"),
        ]);
        let mut config = RetrievalConfig::default();
        config.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        assert!(config.guardrail.fail_open);
        assert_eq!(
            config.search,
            PipelineConfig::new([(GUARDRAIL, true), (NORMALIZATION, false)])
        );
        assert_eq!(
            config.therapy,
            PipelineConfig::new([
                (GUARDRAIL, true),
                (NORMALIZATION, false),
                (QUERY_REWRITE, true)
            ])
        );
    }

    #[test]
    fn test_set_stage_enabled_reports_unknown_stage() {
        let mut config = RetrievalConfig::default();
        assert!(config.set_stage_enabled(QUERY_REWRITE, false));
        assert!(!config.set_stage_enabled("spellcheck", false));
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 100,
        };
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("versefind.toml");
        std::fs::write(&path, "max_k = 7\n").unwrap();

        let config = RetrievalConfig::load(&path).await.unwrap();
        assert_eq!(config.max_k, 7);
    }
}
