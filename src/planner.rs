//! Workflow planner - turns a request into a validated plan

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::config::PlannerConfig;
use crate::error::ConclaveError;
use crate::graph::StepGraph;
use crate::invocation::InvocationClient;
use crate::registry::AgentRegistry;
use crate::template;
use crate::types::{PlanId, Step, StepStatus, SynthesisStrategy, WorkflowPlan, WorkflowRequest};

/// Template name recorded on the single-step plan used when nothing else works
pub const FALLBACK_TEMPLATE: &str = "generic-fallback";

/// A canned decomposition selected by keywords in the goal
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    pub name: String,
    pub keywords: Vec<String>,
    pub synthesis: SynthesisStrategy,
    build: fn(&WorkflowRequest) -> Vec<Step>,
}

impl WorkflowTemplate {
    pub fn new(
        name: impl Into<String>,
        keywords: &[&str],
        synthesis: SynthesisStrategy,
        build: fn(&WorkflowRequest) -> Vec<Step>,
    ) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            synthesis,
            build,
        }
    }

    /// Number of keywords appearing as words of the goal
    fn score(&self, words: &[String]) -> usize {
        self.keywords
            .iter()
            .filter(|k| words.iter().any(|w| w == *k))
            .count()
    }

    pub fn build(&self, request: &WorkflowRequest) -> Vec<Step> {
        (self.build)(request)
    }
}

/// Stock templates, in tie-break order
pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        WorkflowTemplate::new(
            "research-then-summarize",
            &["research", "investigate", "explore"],
            SynthesisStrategy::FinalStep,
            |_| {
                vec![
                    Step::new(
                        "research",
                        "research",
                        "Research the following and report your findings: {{goal}}",
                    ),
                    Step::new(
                        "summarize",
                        "summarize",
                        "Summarize these findings for the request \"{{goal}}\":\n\n{{step.research}}",
                    )
                    .depends_on("research"),
                ]
            },
        ),
        WorkflowTemplate::new(
            "analyze-then-report",
            &["analyze", "analyse", "evaluate", "assess", "audit"],
            SynthesisStrategy::FinalStep,
            |_| {
                vec![
                    Step::new("analyze", "analyze", "Analyze the following: {{goal}}"),
                    Step::new(
                        "report",
                        "report",
                        "Write a report for the request \"{{goal}}\" based on this analysis:\n\n{{step.analyze}}",
                    )
                    .depends_on("analyze"),
                ]
            },
        ),
        WorkflowTemplate::new(
            "summarize-documents",
            &["summarize", "summarise", "digest", "documents", "document"],
            SynthesisStrategy::FinalStep,
            summarize_documents,
        ),
    ]
}

/// `n` parallel fetches feeding one summary
fn summarize_documents(request: &WorkflowRequest) -> Vec<Step> {
    let listed: Vec<String> = match request.parameters.get("documents") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    };
    let count = if listed.is_empty() {
        document_count(&request.goal).unwrap_or(1)
    } else {
        listed.len()
    };

    let mut summary = Step::new(
        "summarize",
        "summarize",
        "Summarize the following documents for the request \"{{goal}}\":\n\n{{inputs}}",
    );
    let mut steps = Vec::with_capacity(count + 1);
    for n in 1..=count {
        let id = format!("fetch-{n}");
        let input = match listed.get(n - 1) {
            Some(doc) => format!("Fetch and extract the content of: {doc}"),
            None => format!("Fetch document {n} of {count} relevant to: {{{{goal}}}}"),
        };
        steps.push(Step::new(id.as_str(), "fetch", input));
        summary = summary.depends_on(id);
    }
    steps.push(summary);
    steps
}

/// Count mentioned in the goal, as digits or a small number word
fn document_count(goal: &str) -> Option<usize> {
    const WORDS: [&str; 12] = [
        "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "eleven",
        "twelve",
    ];
    words(goal).iter().find_map(|word| {
        word.parse::<usize>()
            .ok()
            .or_else(|| WORDS.iter().position(|w| w == word).map(|i| i + 1))
            .filter(|n| (1..=32).contains(n))
    })
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Deserialize)]
struct ProposedPlan {
    steps: Vec<ProposedStep>,
    #[serde(default)]
    synthesis: Option<SynthesisStrategy>,
}

#[derive(Debug, Deserialize)]
struct ProposedStep {
    id: String,
    agent_type: String,
    input: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    fallback_for: Option<String>,
}

/// Produces validated workflow plans
pub struct WorkflowPlanner {
    registry: Arc<AgentRegistry>,
    client: Arc<InvocationClient>,
    config: PlannerConfig,
    templates: Vec<WorkflowTemplate>,
}

impl WorkflowPlanner {
    pub fn new(
        registry: Arc<AgentRegistry>,
        client: Arc<InvocationClient>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            registry,
            client,
            config,
            templates: builtin_templates(),
        }
    }

    /// Replace the template set
    pub fn with_templates(mut self, templates: Vec<WorkflowTemplate>) -> Self {
        self.templates = templates;
        self
    }

    /// Best-scoring template for the goal, if any keyword matches
    pub fn classify(&self, request: &WorkflowRequest) -> Option<&WorkflowTemplate> {
        let words = words(&request.goal);
        let mut best: Option<(&WorkflowTemplate, usize)> = None;
        for template in &self.templates {
            let score = template.score(&words);
            if score > 0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((template, score));
            }
        }
        best.map(|(template, _)| template)
    }

    /// Plan a request: template, else LLM proposal, else a single generic step.
    ///
    /// Invalid graphs and unknown agent types are fatal; nothing is returned
    /// for them.
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn plan(&self, request: &WorkflowRequest) -> Result<WorkflowPlan, ConclaveError> {
        if let Some(template) = self.classify(request) {
            info!(template = %template.name, "Request matched workflow template");
            return self.assemble(
                request,
                Some(template.name.clone()),
                template.build(request),
                template.synthesis.clone(),
            );
        }

        if let Some(proposal) = self.propose(request).await {
            info!(steps = proposal.steps.len(), "Using LLM-proposed plan");
            let steps = proposal
                .steps
                .into_iter()
                .map(|p| {
                    let step = p
                        .depends_on
                        .into_iter()
                        .fold(Step::new(p.id, p.agent_type, p.input), Step::depends_on);
                    match p.fallback_for {
                        Some(primary) => step.fallback_for(primary),
                        None => step,
                    }
                })
                .collect();
            return self.assemble(request, None, steps, proposal.synthesis.unwrap_or_default());
        }

        warn!("No template and no usable planning answer, falling back to a single generic step");
        self.assemble(
            request,
            Some(FALLBACK_TEMPLATE.to_string()),
            vec![Step::new("respond", self.config.fallback_agent.as_str(), "{{goal}}")],
            SynthesisStrategy::FinalStep,
        )
    }

    /// New version of `previous` for the same request
    pub async fn replan(
        &self,
        request: &WorkflowRequest,
        previous: &WorkflowPlan,
    ) -> Result<WorkflowPlan, ConclaveError> {
        let mut plan = self.plan(request).await?;
        plan.version = previous.version + 1;
        plan.parent_plan_id = Some(previous.plan_id);
        info!(plan_id = %plan.plan_id, version = plan.version, parent = %previous.plan_id, "Replanned request");
        Ok(plan)
    }

    /// Validate caller- or template-supplied steps and build version 1 of a plan
    pub fn assemble(
        &self,
        request: &WorkflowRequest,
        template_name: Option<String>,
        steps: Vec<Step>,
        synthesis: SynthesisStrategy,
    ) -> Result<WorkflowPlan, ConclaveError> {
        if steps.is_empty() {
            return Err(ConclaveError::InvalidPlan("plan has no steps".into()));
        }
        for step in &steps {
            self.registry.resolve(&step.agent_type)?;
            template::validate(step, request)?;
        }
        if let SynthesisStrategy::Summarize { agent_type } = &synthesis {
            self.registry.resolve(agent_type)?;
        }
        StepGraph::build(&steps)?;

        let steps = steps
            .into_iter()
            .map(|mut step| {
                step.status = if step.dependencies.is_empty() && step.fallback_for.is_none() {
                    StepStatus::Ready
                } else {
                    StepStatus::Pending
                };
                step.attempt_count = 0;
                step.output = None;
                step.error = None;
                step.started_at = None;
                step.finished_at = None;
                step
            })
            .collect();

        let plan = WorkflowPlan {
            plan_id: PlanId::new(),
            request_id: request.request_id.clone(),
            version: 1,
            parent_plan_id: None,
            template: template_name,
            synthesis,
            steps,
            created_at: Utc::now(),
        };
        debug!(plan_id = %plan.plan_id, steps = plan.steps.len(), "Assembled plan");
        Ok(plan)
    }

    /// Ask the planning agent for a step list, retrying per config
    async fn propose(&self, request: &WorkflowRequest) -> Option<ProposedPlan> {
        if !self.config.llm_planning {
            return None;
        }
        let descriptor = match self.registry.resolve(&self.config.planner_agent) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                warn!(agent_type = %self.config.planner_agent, "Planning agent not registered");
                return None;
            }
        };

        let prompt = self.planning_prompt(request);
        let context = format!("{}/plan", request.request_id);
        for attempt in 1..=self.config.planning_attempts.max(1) {
            match self.client.invoke(&descriptor, &prompt, &context).await {
                Ok(output) => match parse_proposal(&output.text) {
                    Ok(proposal) => return Some(proposal),
                    Err(e) => warn!(attempt, error = %e, "Unusable planning answer"),
                },
                Err(failure) => warn!(attempt, error = %failure, "Planning call failed"),
            }
        }
        None
    }

    fn planning_prompt(&self, request: &WorkflowRequest) -> String {
        let mut parameters: Vec<&String> = request.parameters.keys().collect();
        parameters.sort();
        format!(
            r#"Decompose the request below into steps for the available agents.

Request: {goal}
Available agent types: {agents}
Request parameters: {params}

Reply with JSON only, in this shape:
{{"steps": [{{"id": "step-1", "agent_type": "<type>", "input": "<instructions>", "depends_on": []}}],
 "synthesis": {{"strategy": "final_step"}}}}

Inputs may use {{{{goal}}}}, {{{{param.NAME}}}}, {{{{step.ID}}}} for a dependency's output and {{{{inputs}}}} for all dependency outputs.
Dependencies must form an acyclic graph."#,
            goal = request.goal,
            agents = self.registry.agent_types().join(", "),
            params = if parameters.is_empty() {
                "none".to_string()
            } else {
                parameters
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        )
    }
}

/// Parse a planning answer, tolerating surrounding prose or code fences
fn parse_proposal(text: &str) -> Result<ProposedPlan, ConclaveError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => return Err(ConclaveError::InvalidPlan("no JSON object in answer".into())),
    };
    let proposal: ProposedPlan =
        serde_json::from_str(json).map_err(|e| ConclaveError::InvalidPlan(e.to_string()))?;
    if proposal.steps.is_empty() {
        return Err(ConclaveError::InvalidPlan("proposal has no steps".into()));
    }
    Ok(proposal)
}
