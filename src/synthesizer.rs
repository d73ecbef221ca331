//! Result synthesizer - folds terminal step outputs into one answer

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::error::{ConclaveError, StoreError};
use crate::executor::{classify_plan, effective_output};
use crate::graph::StepGraph;
use crate::invocation::InvocationClient;
use crate::registry::AgentRegistry;
use crate::store::StateStore;
use crate::types::{
    PlanId, ResultStatus, Step, StepId, StepStatus, SynthesisStrategy, WorkflowPlan,
    WorkflowResult,
};

/// Builds and persists the [`WorkflowResult`] of a terminal plan
pub struct ResultSynthesizer {
    registry: Arc<AgentRegistry>,
    client: Arc<InvocationClient>,
    store: Arc<dyn StateStore>,
}

impl ResultSynthesizer {
    pub fn new(
        registry: Arc<AgentRegistry>,
        client: Arc<InvocationClient>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            registry,
            client,
            store,
        }
    }

    /// Result for a terminal plan, computed once and stored.
    ///
    /// A second call returns the stored result. A failing summarization
    /// degrades the result to `PartiallyCompleted` with no synthesized
    /// output; raw step outputs are always returned.
    #[instrument(skip(self))]
    pub async fn synthesize(&self, plan_id: PlanId) -> Result<WorkflowResult, ConclaveError> {
        if let Some(existing) = self.store.get_result(plan_id).await? {
            return Ok(existing);
        }

        let plan = self.store.get_plan(plan_id).await?;
        if !plan.is_terminal() {
            return Err(ConclaveError::NotReady(plan.request_id));
        }
        let graph = StepGraph::build(&plan.steps)?;
        let mut status = classify_plan(&graph, &plan.steps);

        let step_outputs: BTreeMap<StepId, String> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .filter_map(|s| s.output.as_ref().map(|o| (s.step_id.clone(), o.text.clone())))
            .collect();

        let synthesized_output = match &plan.synthesis {
            SynthesisStrategy::FinalStep => final_output(&graph, &plan.steps),
            SynthesisStrategy::Concatenate => join_in_order(&graph, &plan.steps, |_| true),
            SynthesisStrategy::Summarize { agent_type } => {
                match self.summarize(&plan, &graph, agent_type, status).await {
                    Some(text) => Some(text),
                    None => {
                        if status == ResultStatus::Completed {
                            status = ResultStatus::PartiallyCompleted;
                        }
                        None
                    }
                }
            }
        };

        let result = WorkflowResult {
            request_id: plan.request_id.clone(),
            plan_id,
            status,
            synthesized_output,
            step_outputs,
            completed_at: Utc::now(),
        };

        match self.store.put_result(&result).await {
            Ok(()) => {
                info!(plan_id = %plan_id, status = %result.status, outputs = result.step_outputs.len(), "Result stored");
                Ok(result)
            }
            Err(StoreError::AlreadyExists(_)) => self
                .store
                .get_result(plan_id)
                .await?
                .ok_or_else(|| ConclaveError::PlanNotFound(plan_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the summarizing agent over every output; `None` on failure
    async fn summarize(
        &self,
        plan: &WorkflowPlan,
        graph: &StepGraph,
        agent_type: &str,
        status: ResultStatus,
    ) -> Option<String> {
        if status == ResultStatus::Failed {
            return None;
        }
        let outputs = join_in_order(graph, &plan.steps, |_| true)?;
        let descriptor = match self.registry.resolve(agent_type) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(plan_id = %plan.plan_id, error = %e, "Synthesis degraded");
                return None;
            }
        };

        let input = format!(
            "Combine the following step outputs into a single coherent answer.\n\n{outputs}"
        );
        let context = format!("{}/synthesis", plan.plan_id);
        match self.client.invoke(&descriptor, &input, &context).await {
            Ok(output) => {
                info!(
                    plan_id = %plan.plan_id,
                    attempts = output.attempts,
                    tokens = output.token_usage.total_tokens,
                    "Synthesis complete"
                );
                Some(output.text)
            }
            Err(failure) => {
                warn!(plan_id = %plan.plan_id, error = %failure, "Synthesis degraded to raw step outputs");
                None
            }
        }
    }
}

/// Critical-path output: verbatim for a single leaf, labelled otherwise
fn final_output(graph: &StepGraph, steps: &[Step]) -> Option<String> {
    let leaves = graph.critical_path();
    if let [leaf] = leaves.as_slice() {
        let by_id: HashMap<&StepId, &Step> = steps.iter().map(|s| (&s.step_id, s)).collect();
        return effective_output(graph, &by_id, leaf).map(|o| o.text.clone());
    }
    join_in_order(graph, steps, |id| leaves.contains(id))
}

/// Labelled effective outputs of non-fallback steps in plan order
fn join_in_order<F>(graph: &StepGraph, steps: &[Step], include: F) -> Option<String>
where
    F: Fn(&StepId) -> bool,
{
    let by_id: HashMap<&StepId, &Step> = steps.iter().map(|s| (&s.step_id, s)).collect();
    let sections: Vec<String> = steps
        .iter()
        .filter(|s| !s.is_fallback() && include(&s.step_id))
        .filter_map(|s| {
            effective_output(graph, &by_id, &s.step_id)
                .map(|o| format!("[{}]\n{}", s.step_id, o.text))
        })
        .collect();
    (!sections.is_empty()).then(|| sections.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InvocationConfig;
    use crate::error::InvocationError;
    use crate::registry::{AgentDescriptor, RetryPolicy};
    use crate::store::InMemoryStateStore;
    use crate::testing::{Scripted, ScriptedTransport};
    use crate::types::{RequestId, StepOutput, TokenUsage};

    fn done(id: &str, deps: &[&str], status: StepStatus) -> Step {
        let mut step = deps
            .iter()
            .fold(Step::new(id, "generic", "x"), |s, d| s.depends_on(*d));
        step.status = status;
        if status == StepStatus::Succeeded {
            step.output = Some(StepOutput {
                text: format!("text of {id}"),
                token_usage: TokenUsage::default(),
                latency_ms: 1,
            });
        }
        step
    }

    async fn setup(
        steps: Vec<Step>,
        synthesis: SynthesisStrategy,
        transport: ScriptedTransport,
    ) -> (ResultSynthesizer, Arc<InMemoryStateStore>, PlanId) {
        let store = Arc::new(InMemoryStateStore::new());
        let plan = WorkflowPlan {
            plan_id: PlanId::new(),
            request_id: RequestId::from("req"),
            version: 1,
            parent_plan_id: None,
            template: None,
            synthesis,
            steps,
            created_at: Utc::now(),
        };
        store.put_plan(&plan).await.unwrap();

        let mut registry = AgentRegistry::with_builtin_agents(&InvocationConfig::default());
        registry.register(
            AgentDescriptor::new("summarize", "combine").with_retry_policy(RetryPolicy::none()),
        );
        let synthesizer = ResultSynthesizer::new(
            Arc::new(registry),
            Arc::new(InvocationClient::new(Arc::new(transport))),
            store.clone(),
        );
        (synthesizer, store, plan.plan_id)
    }

    #[tokio::test]
    async fn test_final_step_verbatim() {
        let steps = vec![
            done("fetch", &[], StepStatus::Succeeded),
            done("summarize", &["fetch"], StepStatus::Succeeded),
        ];
        let (synthesizer, _, plan_id) =
            setup(steps, SynthesisStrategy::FinalStep, ScriptedTransport::new()).await;

        let result = synthesizer.synthesize(plan_id).await.unwrap();
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.synthesized_output.as_deref(), Some("text of summarize"));
        assert_eq!(result.step_outputs.len(), 2);
    }

    #[tokio::test]
    async fn test_skipped_leaf_returns_raw_outputs() {
        let steps = vec![
            done("fetch-1", &[], StepStatus::Succeeded),
            done("fetch-2", &[], StepStatus::Failed),
            done("summarize", &["fetch-1", "fetch-2"], StepStatus::Skipped),
        ];
        let (synthesizer, _, plan_id) =
            setup(steps, SynthesisStrategy::FinalStep, ScriptedTransport::new()).await;

        let result = synthesizer.synthesize(plan_id).await.unwrap();
        assert_eq!(result.status, ResultStatus::PartiallyCompleted);
        assert!(result.synthesized_output.is_none());
        assert_eq!(
            result.step_outputs.keys().map(StepId::as_str).collect::<Vec<_>>(),
            vec!["fetch-1"]
        );
    }

    #[tokio::test]
    async fn test_concatenate_in_plan_order() {
        let steps = vec![
            done("b", &[], StepStatus::Succeeded),
            done("a", &[], StepStatus::Succeeded),
        ];
        let (synthesizer, _, plan_id) =
            setup(steps, SynthesisStrategy::Concatenate, ScriptedTransport::new()).await;

        let result = synthesizer.synthesize(plan_id).await.unwrap();
        assert_eq!(
            result.synthesized_output.as_deref(),
            Some("[b]\ntext of b\n\n[a]\ntext of a")
        );
    }

    #[tokio::test]
    async fn test_summarize_invokes_agent() {
        let steps = vec![done("a", &[], StepStatus::Succeeded)];
        let transport = ScriptedTransport::new()
            .script("synthesis", vec![Scripted::Reply("the answer".into())]);
        let (synthesizer, _, plan_id) = setup(
            steps,
            SynthesisStrategy::Summarize {
                agent_type: "summarize".into(),
            },
            transport,
        )
        .await;

        let result = synthesizer.synthesize(plan_id).await.unwrap();
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.synthesized_output.as_deref(), Some("the answer"));
    }

    #[tokio::test]
    async fn test_summarize_failure_degrades() {
        let steps = vec![done("a", &[], StepStatus::Succeeded)];
        let transport = ScriptedTransport::new().always(
            "synthesis",
            Scripted::Fail(InvocationError::Permanent("rejected".into())),
        );
        let (synthesizer, _, plan_id) = setup(
            steps,
            SynthesisStrategy::Summarize {
                agent_type: "summarize".into(),
            },
            transport,
        )
        .await;

        let result = synthesizer.synthesize(plan_id).await.unwrap();
        assert_eq!(result.status, ResultStatus::PartiallyCompleted);
        assert!(result.synthesized_output.is_none());
        assert_eq!(result.step_outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_not_ready_and_idempotent() {
        let steps = vec![done("a", &[], StepStatus::Running)];
        let (synthesizer, store, plan_id) =
            setup(steps, SynthesisStrategy::FinalStep, ScriptedTransport::new()).await;
        assert!(matches!(
            synthesizer.synthesize(plan_id).await,
            Err(ConclaveError::NotReady(_))
        ));

        let running = store.get_step(plan_id, &"a".into()).await.unwrap();
        let finished = running
            .succeed(
                StepOutput {
                    text: "ok".into(),
                    token_usage: TokenUsage::default(),
                    latency_ms: 1,
                },
                1,
            )
            .unwrap();
        store
            .conditional_update_step(plan_id, &"a".into(), StepStatus::Running, finished)
            .await
            .unwrap();

        let first = synthesizer.synthesize(plan_id).await.unwrap();
        let second = synthesizer.synthesize(plan_id).await.unwrap();
        assert_eq!(first, second);
    }
}
