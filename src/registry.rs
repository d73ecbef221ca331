//! Agent registry - maps agent types to their configuration

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::InvocationConfig;
use crate::error::ConclaveError;

/// Catch-all agent used when nothing more specific applies.
pub const GENERIC_AGENT: &str = "generic";
/// Agent used for LLM-based planning.
pub const PLANNER_AGENT: &str = "planner";

/// Retry schedule for transient invocation failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Randomize each delay within its upper half
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 8_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Configuration of one agent type. Pure data; behavior lives in the
/// invocation client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_type: String,
    pub model_id: String,
    pub system_instructions: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl AgentDescriptor {
    pub fn new(agent_type: impl Into<String>, system_instructions: impl Into<String>) -> Self {
        let defaults = InvocationConfig::default();
        Self {
            agent_type: agent_type.into(),
            model_id: defaults.default_model,
            system_instructions: system_instructions.into(),
            allowed_tools: Vec::new(),
            max_tokens: defaults.default_max_tokens,
            timeout_ms: defaults.default_timeout_ms,
            retry_policy: defaults.retry,
        }
    }

    /// Apply engine-wide invocation defaults
    pub fn with_defaults(mut self, defaults: &InvocationConfig) -> Self {
        self.model_id = defaults.default_model.clone();
        self.max_tokens = defaults.default_max_tokens;
        self.timeout_ms = defaults.default_timeout_ms;
        self.retry_policy = defaults.retry.clone();
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.allowed_tools.push(tool.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Read-only lookup from agent type to descriptor.
///
/// Populated at startup, then shared behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentDescriptor>>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the stock agent types
    pub fn with_builtin_agents(defaults: &InvocationConfig) -> Self {
        let mut registry = Self::new();
        for descriptor in builtin_agents() {
            registry.register(descriptor.with_defaults(defaults));
        }
        registry
    }

    /// Register (or replace) a descriptor
    pub fn register(&mut self, descriptor: AgentDescriptor) {
        info!(agent_type = %descriptor.agent_type, model = %descriptor.model_id, "Registered agent type");
        self.agents
            .insert(descriptor.agent_type.clone(), Arc::new(descriptor));
    }

    pub fn resolve(&self, agent_type: &str) -> Result<Arc<AgentDescriptor>, ConclaveError> {
        self.agents
            .get(agent_type)
            .cloned()
            .ok_or_else(|| ConclaveError::UnknownAgentType(agent_type.to_string()))
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.agents.contains_key(agent_type)
    }

    /// Registered agent types, sorted
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.agents.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn builtin_agents() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new(
            GENERIC_AGENT,
            "You are a capable general-purpose assistant. Complete the task directly and concisely.",
        ),
        AgentDescriptor::new(
            PLANNER_AGENT,
            "You decompose requests into small steps for specialized agents. Reply with JSON only.",
        ),
        AgentDescriptor::new(
            "fetch",
            "You retrieve and extract the content relevant to the task. Return the content, not commentary.",
        )
        .with_tool("http_get"),
        AgentDescriptor::new(
            "research",
            "You research a topic and return well-organized findings with sources where possible.",
        )
        .with_tool("web_search"),
        AgentDescriptor::new(
            "analyze",
            "You analyze the provided material and report observations, risks and conclusions.",
        ),
        AgentDescriptor::new(
            "summarize",
            "You write faithful, compact summaries of the provided inputs.",
        ),
        AgentDescriptor::new(
            "report",
            "You turn analysis into a clear report for a non-specialist reader.",
        ),
    ]
}
