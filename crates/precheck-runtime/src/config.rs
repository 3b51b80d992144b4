//! Runtime configuration.
//!
//! One immutable [`RuntimeConfig`] value is constructed at process start
//! (defaults, then environment overrides, optionally a YAML file) and passed
//! by reference everywhere. Nothing mutates it mid-run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use precheck_core::{DecisionThresholds, ScoringWeights};

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Bounds on the agent controller loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum tool-loop iterations per run.
    pub max_iterations: u32,

    /// Wall-clock budget for a whole run (in seconds).
    #[serde(with = "duration_secs")]
    pub run_budget: Duration,

    /// Timeout applied to each individual tool invocation (in seconds).
    #[serde(with = "duration_secs")]
    pub tool_timeout: Duration,

    /// Retries per capability before it is marked unavailable.
    pub tool_retry_limit: u32,

    /// How long the vision adapter waits for an in-flight background
    /// extraction before extracting directly (in seconds).
    #[serde(with = "duration_secs")]
    pub extraction_wait: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            run_budget: Duration::from_secs(300),
            tool_timeout: Duration::from_secs(60),
            tool_retry_limit: 2,
            extraction_wait: Duration::from_secs(15),
        }
    }
}

/// Historical-retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Minimum similarity for a match to count.
    pub match_threshold: f64,

    /// Matches fetched from the index.
    pub limit: usize,

    /// Matches surfaced to the risk scanner.
    pub surfaced: usize,

    /// Embedding vector dimension; inserts with other dimensions are
    /// rejected by the index.
    pub embedding_dim: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.7,
            limit: 5,
            surfaced: 3,
            embedding_dim: 1536,
        }
    }
}

/// Artifact upload and background-extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum size of a single artifact, in bytes.
    pub max_artifact_bytes: u64,

    /// Maximum artifacts per appraisal.
    pub max_artifacts: usize,

    /// Concurrent background extractions across the process.
    pub extraction_concurrency: usize,

    /// Retries per extraction job.
    pub extraction_retry_limit: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_artifact_bytes: 10 * 1024 * 1024,
            max_artifacts: 8,
            extraction_concurrency: 3,
            extraction_retry_limit: 2,
        }
    }
}

/// The complete, immutable runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub retrieval: RetrievalConfig,
    pub upload: UploadConfig,
    pub weights: ScoringWeights,
    pub thresholds: DecisionThresholds,
}

impl RuntimeConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Apply environment overrides for the operationally interesting knobs.
    ///
    /// Recognized: `PRECHECK_MAX_ITERATIONS`, `PRECHECK_RUN_BUDGET`,
    /// `PRECHECK_TOOL_TIMEOUT`, `PRECHECK_MATCH_THRESHOLD`. Durations accept
    /// humantime strings ("300s", "5m").
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<u32>("PRECHECK_MAX_ITERATIONS") {
            self.controller.max_iterations = v;
        }
        if let Some(v) = env_duration("PRECHECK_RUN_BUDGET") {
            self.controller.run_budget = v;
        }
        if let Some(v) = env_duration("PRECHECK_TOOL_TIMEOUT") {
            self.controller.tool_timeout = v;
        }
        if let Some(v) = env_parse::<f64>("PRECHECK_MATCH_THRESHOLD") {
            self.retrieval.match_threshold = v;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_duration(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| humantime::parse_duration(&v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.controller.max_iterations, 50);
        assert_eq!(config.controller.run_budget, Duration::from_secs(300));
        assert_eq!(config.retrieval.match_threshold, 0.7);
        assert_eq!(config.thresholds.ready, 80);
        assert_eq!(config.weights.risk_penalty_cap, 7);
    }

    #[test]
    fn test_yaml_round_trip_durations_as_seconds() {
        let config = RuntimeConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("run_budget: 300"));

        let back = RuntimeConfig::from_yaml(&yaml).unwrap();
        assert_eq!(back.controller.run_budget, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "controller:\n  max_iterations: 10\n  run_budget: 60\n  tool_timeout: 5\n  tool_retry_limit: 1\n  extraction_wait: 2\n";
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.controller.max_iterations, 10);
        // Untouched sections keep defaults.
        assert_eq!(config.retrieval.limit, 5);
    }
}
