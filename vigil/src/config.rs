//! Pipeline configuration with a single resolution path.
//!
//! Every entry point resolves configuration through
//! [`PipelineConfig::resolve`]: explicit path, then the `VIGIL_CONFIG`
//! environment variable, then `vigil.json` in the working directory, then
//! built-in defaults. Absence of a config file never prevents a run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "VIGIL_CONFIG";
/// Environment variable overriding the model identifier.
pub const MODEL_ENV: &str = "VIGIL_MODEL";
/// Environment variable overriding per-stage concurrency.
pub const CONCURRENCY_ENV: &str = "VIGIL_MAX_CONCURRENCY";
/// Default config file name looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "vigil.json";

/// Model client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier sent to the transport.
    pub model_id: String,
    /// Endpoint URL for the HTTP transport.
    pub endpoint: String,
    /// Maximum completion tokens per call.
    pub max_tokens: u32,
    /// Retry attempts for transient failures (includes the first call).
    pub retry_attempts: u32,
    /// Base backoff delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Backoff delay cap in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Per-call timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "claude-sonnet-4-5".to_string(),
            endpoint: "http://localhost:11434/api/generate".to_string(),
            max_tokens: 4096,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            request_timeout_secs: 300,
        }
    }
}

/// Retrieval and chunking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Target chunk size in characters.
    pub chunk_chars: usize,
    /// Overlap carried between adjacent chunks, in characters.
    pub chunk_overlap: usize,
    /// Maximum chunks returned per retrieval.
    pub max_chunks: usize,
    /// Maximum characters kept per returned chunk.
    pub max_chars_per_chunk: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_chars: 6000,
            chunk_overlap: 800,
            max_chunks: 10,
            max_chars_per_chunk: 4000,
        }
    }
}

/// Orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Stages that halt for human approval.
    pub human_gates: Vec<u32>,
    /// Bounded worker count for per-item model calls inside a stage.
    pub max_concurrency: usize,
    /// Directory for `export` output.
    pub export_dir: PathBuf,
    /// Directory scanned by the ingest stage.
    pub ingest_dir: PathBuf,
    /// Path of the JSON snapshot store used by the CLI.
    pub store_path: PathBuf,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            human_gates: vec![2, 5],
            max_concurrency: 5,
            export_dir: PathBuf::from("./results"),
            ingest_dir: PathBuf::from("./corpus"),
            store_path: PathBuf::from("./vigil_store.json"),
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Model client settings.
    pub model: ModelConfig,
    /// Retrieval settings.
    pub retrieval: RetrievalConfig,
    /// Orchestration settings.
    pub pipeline: OrchestrationConfig,
}

impl PipelineConfig {
    /// Resolves configuration with the documented precedence order:
    /// explicit path > `VIGIL_CONFIG` > `./vigil.json` > defaults, with
    /// `VIGIL_MODEL` and `VIGIL_MAX_CONCURRENCY` applied on top.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, std::io::Error> {
        let mut config = match Self::config_path(explicit) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Returns true if the given stage halts for human approval.
    #[must_use]
    pub fn is_gated(&self, stage: u32) -> bool {
        self.pipeline.human_gates.contains(&stage)
    }

    fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    }

    fn load(path: &Path) -> Result<Self, std::io::Error> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid config {}: {e}", path.display()),
            )
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model_id) = std::env::var(MODEL_ENV) {
            if !model_id.is_empty() {
                self.model.model_id = model_id;
            }
        }
        if let Ok(raw) = std::env::var(CONCURRENCY_ENV) {
            if let Ok(n) = raw.parse::<usize>() {
                if n > 0 {
                    self.pipeline.max_concurrency = n;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_every_field() {
        let config = PipelineConfig::default();
        assert_eq!(config.model.retry_attempts, 3);
        assert_eq!(config.retrieval.max_chunks, 10);
        assert_eq!(config.pipeline.human_gates, vec![2, 5]);
        assert!(config.is_gated(2));
        assert!(config.is_gated(5));
        assert!(!config.is_gated(3));
    }

    #[test]
    fn resolve_without_file_uses_defaults() {
        let config = PipelineConfig::resolve(Some(Path::new("/nonexistent/dir/x.json")));
        // An explicit path that does not exist is an error, not a silent default.
        assert!(config.is_err());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"model": {{"max_tokens": 1024}}, "pipeline": {{"human_gates": [5]}}}}"#
        )
        .unwrap();

        let config = PipelineConfig::resolve(Some(file.path())).unwrap();
        assert_eq!(config.model.max_tokens, 1024);
        // Untouched fields keep their defaults.
        assert_eq!(config.model.retry_attempts, 3);
        assert_eq!(config.pipeline.human_gates, vec![5]);
        assert!(!config.is_gated(2));
    }

    #[test]
    fn config_snapshot_round_trips() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model.model_id, config.model.model_id);
        assert_eq!(back.pipeline.max_concurrency, config.pipeline.max_concurrency);
    }
}
