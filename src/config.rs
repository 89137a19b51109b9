//! Engine configuration.
//!
//! Every section has a `Default` and deserializes with `#[serde(default)]`,
//! so a JSON file only needs to name the fields it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Dispatch layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of long-lived model server threads.
    pub servers: usize,
    /// Number of per-worker reply channels.
    pub reply_channels: usize,
    /// Capacity of the shared request channel.
    pub queue_capacity: usize,
    /// Maximum queued requests a server drains into one batch.
    pub max_batch: usize,
    /// Per-request reply timeout.
    pub request_timeout_ms: u64,
    /// Retries after a retryable failure (timeouts, full queue).
    pub max_retries: u32,
    /// Linear backoff step between retries.
    pub retry_backoff_ms: u64,
    /// Consecutive failures that open a model's circuit.
    pub breaker_threshold: u32,
    /// How long an open circuit rejects calls before a trial call.
    pub breaker_cooldown_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            servers: 2,
            reply_channels: 50,
            queue_capacity: 1024,
            max_batch: 8,
            request_timeout_ms: 120_000,
            max_retries: 2,
            retry_backoff_ms: 100,
            breaker_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    /// Per-attempt reply deadline.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Pause between retries.
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// How long an open circuit rejects calls.
    #[must_use]
    pub const fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

/// Segment behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Minimum cosine similarity for two face embeddings to be the same person.
    pub face_match_threshold: f32,
    /// Reference embeddings kept per identity.
    pub max_references: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            face_match_threshold: 0.6,
            max_references: 16,
        }
    }
}

/// Prompt used for the final decision. `{info}`, `{question}` and
/// `{options}` are substituted.
pub const DEFAULT_SELECT_TEMPLATE: &str = "You are given notes collected from the frames of a video.\n\
Notes:\n{info}\n\n\
Question: {question}\n\
Options: {options}\n\n\
Pick exactly one option. Reply with a JSON object of the form \
{\"answer\": \"<option>\", \"reason\": \"<one sentence>\"} and nothing else.";

/// Answer selector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Maximum characters the decision model accepts.
    pub prompt_budget: usize,
    /// Maximum characters per summarization chunk.
    pub chunk_limit: usize,
    /// Reduction rounds before the text is truncated to fit.
    pub max_rounds: usize,
    /// Decision prompt template.
    pub template: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            prompt_budget: 20_000,
            chunk_limit: 10_000,
            max_rounds: 6,
            template: DEFAULT_SELECT_TEMPLATE.to_string(),
        }
    }
}

impl SelectorConfig {
    /// Template length, counted in characters.
    #[must_use]
    pub fn template_len(&self) -> usize {
        self.template.chars().count()
    }

    /// Characters left for the evidence text once the template is filled.
    #[must_use]
    pub fn text_budget(&self) -> usize {
        self.prompt_budget.saturating_sub(self.template_len())
    }
}

/// Program executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interpreter steps before a program is aborted.
    pub step_limit: u64,
    /// Maximum nesting of program function calls.
    pub max_call_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_limit: 10_000_000,
            max_call_depth: 64,
        }
    }
}

/// Which key programs are cached under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramCacheKey {
    /// Samples sharing a grouping key share one program.
    Group,
    /// Every sample gets its own program.
    Sample,
}

/// Batch orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Samples per batch.
    pub batch_size: usize,
    /// Upper bound on pooled workers.
    pub max_workers: usize,
    /// Execute batches on the worker pool instead of in-process.
    pub parallel: bool,
    /// Report running accuracy every N batches; `None` disables it.
    pub accuracy_every: Option<usize>,
    /// Key generated programs are cached under.
    pub program_cache: ProgramCacheKey,
    /// Root directory result tables are written under.
    pub results_dir: PathBuf,
    /// Dataset split name; results land in `results_dir/split`.
    pub split: String,
    /// Persist the result table after the run.
    pub save: bool,
    /// Write `results_<n>.json` instead of overwriting `results.json`.
    pub save_new_results: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            max_workers: 50,
            parallel: true,
            accuracy_every: Some(1),
            program_cache: ProgramCacheKey::Group,
            results_dir: PathBuf::from("results"),
            split: "test".to_string(),
            save: true,
            save_new_results: true,
        }
    }
}

impl OrchestratorConfig {
    /// Worker pool size: `min(batch_size, max_workers)`.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.batch_size.min(self.max_workers).max(1)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model server pool and call policy.
    pub dispatch: DispatchConfig,
    /// Segment and identity settings.
    pub segment: SegmentConfig,
    /// Answer selection budgets.
    pub selector: SelectorConfig,
    /// Interpreter limits.
    pub executor: ExecutorConfig,
    /// Batching, pooling and persistence.
    pub orchestrator: OrchestratorConfig,
}

impl EngineConfig {
    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dispatch;
        if d.servers == 0 {
            return Err(ConfigError::invalid("dispatch.servers", "must be at least 1"));
        }
        if d.queue_capacity == 0 || d.max_batch == 0 {
            return Err(ConfigError::invalid(
                "dispatch.queue_capacity",
                "queue capacity and max batch must be positive",
            ));
        }
        if d.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("dispatch.request_timeout_ms", "must be positive"));
        }
        if d.breaker_threshold == 0 {
            return Err(ConfigError::invalid("dispatch.breaker_threshold", "must be at least 1"));
        }

        let s = &self.selector;
        if s.chunk_limit == 0 || s.chunk_limit >= s.prompt_budget {
            return Err(ConfigError::invalid(
                "selector.chunk_limit",
                format!("must be in 1..{}", s.prompt_budget),
            ));
        }
        if s.text_budget() == 0 {
            return Err(ConfigError::invalid(
                "selector.template",
                "template leaves no room for evidence",
            ));
        }
        if !s.template.contains("{info}") {
            return Err(ConfigError::invalid("selector.template", "missing {info} placeholder"));
        }
        if s.max_rounds == 0 {
            return Err(ConfigError::invalid("selector.max_rounds", "must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.segment.face_match_threshold) {
            return Err(ConfigError::invalid(
                "segment.face_match_threshold",
                "must be within [0.0, 1.0]",
            ));
        }

        let o = &self.orchestrator;
        if o.batch_size == 0 {
            return Err(ConfigError::invalid("orchestrator.batch_size", "must be at least 1"));
        }
        if o.accuracy_every == Some(0) {
            return Err(ConfigError::invalid("orchestrator.accuracy_every", "must be at least 1"));
        }
        if o.parallel && d.reply_channels < o.worker_count() {
            return Err(ConfigError::invalid(
                "dispatch.reply_channels",
                format!(
                    "{} reply channels cannot serve {} workers without sharing",
                    d.reply_channels,
                    o.worker_count()
                ),
            ));
        }
        if self.executor.step_limit == 0 || self.executor.max_call_depth == 0 {
            return Err(ConfigError::invalid("executor", "limits must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"orchestrator": {"batch_size": 4}, "selector": {"max_rounds": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.batch_size, 4);
        assert_eq!(config.selector.max_rounds, 3);
        assert_eq!(config.selector.prompt_budget, 20_000);
        assert_eq!(config.orchestrator.program_cache, ProgramCacheKey::Group);
    }

    #[test]
    fn chunk_limit_must_be_below_budget() {
        let mut config = EngineConfig::default();
        config.selector.chunk_limit = config.selector.prompt_budget;
        let err = config.validate().unwrap_err();
        assert!(format!("{err}").contains("selector.chunk_limit"));
    }

    #[test]
    fn reply_channels_must_cover_workers() {
        let mut config = EngineConfig::default();
        config.orchestrator.batch_size = 16;
        config.dispatch.reply_channels = 4;
        assert!(config.validate().is_err());

        config.orchestrator.parallel = false;
        config.validate().unwrap();
    }

    #[test]
    fn worker_count_is_capped() {
        let config = OrchestratorConfig {
            batch_size: 200,
            max_workers: 50,
            ..OrchestratorConfig::default()
        };
        assert_eq!(config.worker_count(), 50);
    }

    #[test]
    fn cache_key_parses_snake_case() {
        let key: ProgramCacheKey = serde_json::from_str("\"sample\"").unwrap();
        assert_eq!(key, ProgramCacheKey::Sample);
    }
}
