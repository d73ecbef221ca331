//! Core workflow types shared by the planner, executor and synthesizer

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConclaveError;

/// Opaque identifier of an incoming request.
///
/// Callers may supply their own; otherwise one is generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a single plan version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Step identifier, unique within one plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A caller's request. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub request_id: RequestId,
    /// What the caller wants, in free text
    pub goal: String,
    /// Caller-supplied context
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            goal: goal.into(),
            parameters: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Use a caller-generated id instead of a random one
    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Parameter rendered as plain text (strings unquoted)
    pub fn parameter_text(&self, key: &str) -> Option<String> {
        self.parameters.get(key).map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether `self -> next` is a legal move of the step state machine.
    ///
    /// `Running -> Running` is a reclaim of an orphaned step on resume and
    /// `Running -> Skipped` discards the result of a cancelled plan.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Skipped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token accounting for one or more invocations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens = self.input_tokens + self.output_tokens;
    }
}

/// Payload of a succeeded step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub text: String,
    pub token_usage: TokenUsage,
    pub latency_ms: u64,
}

/// Why a step ended `Failed` (or was discarded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient errors persisted past the retry budget
    RetriesExhausted,
    /// The provider rejected the input outright
    Permanent,
    /// The step's agent type is not registered
    UnknownAgent,
    /// The input template could not be rendered
    Template,
    /// A dependency failed or was skipped, or a fallback was not needed
    Unreachable,
    /// Result thrown away because the plan was cancelled or ran out of time
    Discarded,
}

/// Human-readable error descriptor attached to a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: FailureKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// One unit of work within a plan, bound to exactly one agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: StepId,
    pub agent_type: String,
    /// Instructions with `{{...}}` placeholders
    pub input_template: String,
    #[serde(default)]
    pub dependencies: BTreeSet<StepId>,
    /// When set, this step only runs if the named step fails, and its output
    /// stands in for that step's output.
    #[serde(default)]
    pub fallback_for: Option<StepId>,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub output: Option<StepOutput>,
    pub error: Option<StepError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(
        step_id: impl Into<StepId>,
        agent_type: impl Into<String>,
        input_template: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            agent_type: agent_type.into(),
            input_template: input_template.into(),
            dependencies: BTreeSet::new(),
            fallback_for: None,
            status: StepStatus::Pending,
            attempt_count: 0,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<StepId>) -> Self {
        self.dependencies.insert(step_id.into());
        self
    }

    pub fn fallback_for(mut self, step_id: impl Into<StepId>) -> Self {
        self.fallback_for = Some(step_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback_for.is_some()
    }

    /// Copy of this step moved to `next`, or an error if the move is illegal.
    pub fn advance(&self, next: StepStatus) -> Result<Step, ConclaveError> {
        if !self.status.can_transition_to(next) {
            return Err(ConclaveError::InvalidTransition {
                step_id: self.step_id.clone(),
                from: self.status,
                to: next,
            });
        }

        let mut step = self.clone();
        step.status = next;
        match next {
            StepStatus::Running => step.started_at = Some(Utc::now()),
            s if s.is_terminal() => step.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(step)
    }

    pub fn succeed(&self, output: StepOutput, attempts: u32) -> Result<Step, ConclaveError> {
        let mut step = self.advance(StepStatus::Succeeded)?;
        step.attempt_count += attempts;
        step.output = Some(output);
        step.error = None;
        Ok(step)
    }

    pub fn fail(&self, error: StepError, attempts: u32) -> Result<Step, ConclaveError> {
        let mut step = self.advance(StepStatus::Failed)?;
        step.attempt_count += attempts;
        step.output = None;
        step.error = Some(error);
        Ok(step)
    }

    pub fn skip(&self, reason: StepError) -> Result<Step, ConclaveError> {
        let mut step = self.advance(StepStatus::Skipped)?;
        step.output = None;
        step.error = Some(reason);
        Ok(step)
    }
}

/// How the final answer is produced from step outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SynthesisStrategy {
    /// Output of the critical-path steps, verbatim
    FinalStep,
    /// Every step output, in plan order
    Concatenate,
    /// Run an agent over all step outputs
    Summarize { agent_type: String },
}

impl Default for SynthesisStrategy {
    fn default() -> Self {
        Self::FinalStep
    }
}

/// DAG of steps derived from a request.
///
/// Plans are never mutated structurally; replanning creates a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub plan_id: PlanId,
    pub request_id: RequestId,
    pub version: u32,
    /// Plan this one replaces, if any
    pub parent_plan_id: Option<PlanId>,
    /// Name of the template it came from, `None` for LLM-proposed plans
    pub template: Option<String>,
    pub synthesis: SynthesisStrategy,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowPlan {
    pub fn step(&self, step_id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.step_id == step_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.steps.iter().all(Step::is_terminal)
    }
}

/// Overall outcome of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    PartiallyCompleted,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final answer for a request. Created once per terminal plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub request_id: RequestId,
    pub plan_id: PlanId,
    pub status: ResultStatus,
    /// `None` when synthesis was impossible or degraded; raw outputs remain
    /// in `step_outputs`.
    pub synthesized_output: Option<String>,
    pub step_outputs: BTreeMap<StepId, String>,
    pub completed_at: DateTime<Utc>,
}
