//! Engine configuration

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConclaveError;
use crate::registry::{RetryPolicy, GENERIC_AGENT, PLANNER_AGENT};

/// Top-level configuration for an orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConclaveConfig {
    pub executor: ExecutorConfig,
    pub invocation: InvocationConfig,
    pub planner: PlannerConfig,
}

/// Executor limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Steps of one plan allowed to run at once
    pub max_concurrency: usize,
    /// Wall-clock budget for a whole plan
    pub plan_budget_ms: u64,
    /// How often to re-read state while waiting on steps claimed elsewhere
    pub poll_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            plan_budget_ms: 600_000,
            poll_interval_ms: 250,
        }
    }
}

impl ExecutorConfig {
    pub fn plan_budget(&self) -> Duration {
        Duration::from_millis(self.plan_budget_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Defaults applied to built-in agent descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationConfig {
    pub default_model: String,
    pub default_timeout_ms: u64,
    pub default_max_tokens: u32,
    pub retry: RetryPolicy,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-sonnet".to_string(),
            default_timeout_ms: 30_000,
            default_max_tokens: 4_096,
            retry: RetryPolicy::default(),
        }
    }
}

/// Planner behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Ask an LLM for a plan when no template matches
    pub llm_planning: bool,
    /// Planning calls made before falling back (2 = one retry)
    pub planning_attempts: u32,
    pub planner_agent: String,
    pub fallback_agent: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            llm_planning: true,
            planning_attempts: 2,
            planner_agent: PLANNER_AGENT.to_string(),
            fallback_agent: GENERIC_AGENT.to_string(),
        }
    }
}

impl ConclaveConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConclaveError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConclaveError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file, then apply `CONCLAVE_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConclaveError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConclaveError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CONCLAVE_MAX_CONCURRENCY") {
            self.executor.max_concurrency = parse_var("CONCLAVE_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("CONCLAVE_PLAN_BUDGET_MS") {
            self.executor.plan_budget_ms = parse_var("CONCLAVE_PLAN_BUDGET_MS", &v)?;
        }
        if let Some(v) = lookup("CONCLAVE_INVOCATION_TIMEOUT_MS") {
            self.invocation.default_timeout_ms = parse_var("CONCLAVE_INVOCATION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("CONCLAVE_DEFAULT_MODEL") {
            self.invocation.default_model = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConclaveError> {
        if self.executor.max_concurrency == 0 {
            return Err(ConclaveError::ConfigError(
                "executor.max_concurrency must be at least 1".into(),
            ));
        }
        if self.executor.plan_budget_ms == 0 {
            return Err(ConclaveError::ConfigError(
                "executor.plan_budget_ms must be positive".into(),
            ));
        }
        if self.invocation.default_timeout_ms == 0 {
            return Err(ConclaveError::ConfigError(
                "invocation.default_timeout_ms must be positive".into(),
            ));
        }
        if self.invocation.retry.max_attempts == 0 {
            return Err(ConclaveError::ConfigError(
                "invocation.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.planner.planning_attempts == 0 {
            return Err(ConclaveError::ConfigError(
                "planner.planning_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConclaveError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConclaveError::ConfigError(format!("{key}: invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ConclaveConfig::default();
        assert_eq!(config.executor.max_concurrency, 4);
        assert_eq!(config.invocation.default_timeout_ms, 30_000);
        assert_eq!(config.planner.planning_attempts, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            ConclaveConfig::from_json_str(r#"{"executor": {"max_concurrency": 8}}"#).unwrap();
        assert_eq!(config.executor.max_concurrency, 8);
        assert_eq!(config.executor.plan_budget_ms, 600_000);
        assert_eq!(config.invocation.retry.max_attempts, 3);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = ConclaveConfig::from_json_str(r#"{"executor": {"max_concurrency": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, ConclaveError::ConfigError(_)));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CONCLAVE_MAX_CONCURRENCY", "2"),
            ("CONCLAVE_DEFAULT_MODEL", "local-llama"),
        ]
        .into_iter()
        .collect();

        let mut config = ConclaveConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.executor.max_concurrency, 2);
        assert_eq!(config.invocation.default_model, "local-llama");
    }

    #[test]
    fn test_bad_override() {
        let mut config = ConclaveConfig::default();
        let err = config
            .apply_overrides(|k| (k == "CONCLAVE_PLAN_BUDGET_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CONCLAVE_PLAN_BUDGET_MS"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"planner": {{"llm_planning": false}}}}"#).unwrap();

        let config = ConclaveConfig::load(file.path()).unwrap();
        assert!(!config.planner.llm_planning);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConclaveConfig::load("/nonexistent/conclave.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
