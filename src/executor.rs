//! Workflow executor - drives a plan's steps to terminal states
//!
//! The store is the source of truth. Every pass re-reads the steps,
//! promotes or skips pending ones, claims ready ones with a conditional
//! `Ready -> Running` write and runs at most `max_concurrency` of them at
//! once. Events are published only after the state they describe has been
//! written.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, AgentHandle};
use crate::config::ExecutorConfig;
use crate::error::{ConclaveError, InvocationFailure, StoreError};
use crate::events::{EventBus, EventKind, WorkflowEvent};
use crate::graph::StepGraph;
use crate::invocation::{GeneratedOutput, InvocationClient};
use crate::registry::AgentRegistry;
use crate::run::CancelToken;
use crate::store::StateStore;
use crate::template;
use crate::types::{
    FailureKind, PlanId, ResultStatus, Step, StepError, StepId, StepOutput, StepStatus,
    TokenUsage, WorkflowRequest,
};

/// State change decided by [`evaluate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `Pending -> Ready`
    Promote(StepId),
    /// `Pending -> Skipped`, with the reason
    Skip(StepId, String),
}

enum Resolution {
    Satisfied,
    Blocked,
    Unreachable(String),
}

fn resolve(graph: &StepGraph, status: &HashMap<&StepId, StepStatus>, dep: &StepId) -> Resolution {
    match status.get(dep) {
        Some(StepStatus::Succeeded) => Resolution::Satisfied,
        Some(StepStatus::Skipped) => Resolution::Unreachable(format!("dependency '{dep}' was skipped")),
        Some(StepStatus::Failed) => match graph.fallback_of(dep) {
            None => Resolution::Unreachable(format!("dependency '{dep}' failed")),
            Some(fallback) => match status.get(fallback) {
                Some(StepStatus::Succeeded) => Resolution::Satisfied,
                Some(StepStatus::Failed | StepStatus::Skipped) => Resolution::Unreachable(format!(
                    "dependency '{dep}' and its fallback '{fallback}' failed"
                )),
                _ => Resolution::Blocked,
            },
        },
        _ => Resolution::Blocked,
    }
}

/// Decide what should happen to every `Pending` step.
///
/// Skips cascade within one call: a step skipped here makes its dependents
/// unreachable in the same pass.
pub fn evaluate(graph: &StepGraph, steps: &[Step]) -> Vec<Transition> {
    let mut status: HashMap<&StepId, StepStatus> =
        steps.iter().map(|s| (&s.step_id, s.status)).collect();
    let mut transitions = Vec::new();

    for id in graph.topological_order() {
        if status.get(id) != Some(&StepStatus::Pending) {
            continue;
        }

        let decision = decide(graph, &status, id);
        match &decision {
            Some(Transition::Promote(_)) => {
                status.insert(id, StepStatus::Ready);
            }
            Some(Transition::Skip(..)) => {
                status.insert(id, StepStatus::Skipped);
            }
            None => {}
        }
        transitions.extend(decision);
    }
    transitions
}

fn decide(
    graph: &StepGraph,
    status: &HashMap<&StepId, StepStatus>,
    id: &StepId,
) -> Option<Transition> {
    if let Some(primary) = graph.primary_of(id) {
        match status.get(primary) {
            Some(StepStatus::Failed) => {}
            Some(StepStatus::Succeeded) => {
                return Some(Transition::Skip(
                    id.clone(),
                    format!("primary step '{primary}' succeeded"),
                ))
            }
            Some(StepStatus::Skipped) => {
                return Some(Transition::Skip(
                    id.clone(),
                    format!("primary step '{primary}' was skipped"),
                ))
            }
            _ => return None,
        }
    }

    let mut blocked = false;
    for dep in graph.dependencies(id) {
        match resolve(graph, status, &dep) {
            Resolution::Satisfied => {}
            Resolution::Blocked => blocked = true,
            Resolution::Unreachable(reason) => return Some(Transition::Skip(id.clone(), reason)),
        }
    }
    (!blocked).then(|| Transition::Promote(id.clone()))
}

/// Output standing for step `id`: its own, or its fallback's if it failed
pub fn effective_output<'a>(
    graph: &StepGraph,
    steps: &'a HashMap<&StepId, &Step>,
    id: &StepId,
) -> Option<&'a StepOutput> {
    let step = steps.get(id)?;
    match step.status {
        StepStatus::Succeeded => step.output.as_ref(),
        StepStatus::Failed => graph
            .fallback_of(id)
            .and_then(|fallback| steps.get(fallback))
            .filter(|fallback| fallback.status == StepStatus::Succeeded)
            .and_then(|fallback| fallback.output.as_ref()),
        _ => None,
    }
}

/// Plan outcome from terminal step states.
///
/// - `Completed`: every non-fallback step produced an output, directly or
///   through its fallback
/// - `Failed`: nothing succeeded, or every critical-path step ran and failed
/// - `PartiallyCompleted`: anything in between
pub fn classify_plan(graph: &StepGraph, steps: &[Step]) -> ResultStatus {
    let by_id: HashMap<&StepId, &Step> = steps.iter().map(|s| (&s.step_id, s)).collect();
    let produced = |id: &StepId| effective_output(graph, &by_id, id).is_some();

    if steps
        .iter()
        .filter(|s| !s.is_fallback())
        .all(|s| produced(&s.step_id))
    {
        return ResultStatus::Completed;
    }
    if !steps.iter().any(|s| s.status == StepStatus::Succeeded) {
        return ResultStatus::Failed;
    }

    let critical_failed = graph.critical_path().iter().all(|id| {
        !produced(id) && by_id.get(id).map_or(false, |s| s.status == StepStatus::Failed)
    });
    if critical_failed {
        ResultStatus::Failed
    } else {
        ResultStatus::PartiallyCompleted
    }
}

/// What an execution ended with
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub plan_id: PlanId,
    pub status: ResultStatus,
    /// Final step states in plan order
    pub steps: Vec<Step>,
    pub cancelled: bool,
    pub budget_exceeded: bool,
    /// Tokens spent by the steps this executor ran
    pub usage: TokenUsage,
}

/// Result of one step task
struct StepRun {
    claimed: Step,
    outcome: Result<GeneratedOutput, StepError>,
    attempts: u32,
}

enum Halt {
    Finished,
    Cancelled,
    BudgetExceeded,
}

/// Runs plans stored in a [`StateStore`]
pub struct WorkflowExecutor {
    registry: Arc<AgentRegistry>,
    client: Arc<InvocationClient>,
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventBus>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        client: Arc<InvocationClient>,
        store: Arc<dyn StateStore>,
        events: Arc<dyn EventBus>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Drive a stored plan until every step is terminal.
    ///
    /// Safe to run from several executors at once: claims are conditional
    /// writes, so each step runs at most once.
    #[instrument(skip(self, request, cancel), fields(request_id = %request.request_id))]
    pub async fn execute(
        &self,
        plan_id: PlanId,
        request: &WorkflowRequest,
        cancel: CancelToken,
    ) -> Result<ExecutionSummary, ConclaveError> {
        self.drive(plan_id, request, cancel, false).await
    }

    /// Reattach to a plan after a crash.
    ///
    /// Steps found `Running` have no live owner; they are reclaimed and run
    /// again.
    #[instrument(skip(self, request, cancel), fields(request_id = %request.request_id))]
    pub async fn resume(
        &self,
        plan_id: PlanId,
        request: &WorkflowRequest,
        cancel: CancelToken,
    ) -> Result<ExecutionSummary, ConclaveError> {
        self.drive(plan_id, request, cancel, true).await
    }

    async fn drive(
        &self,
        plan_id: PlanId,
        request: &WorkflowRequest,
        cancel: CancelToken,
        reclaim: bool,
    ) -> Result<ExecutionSummary, ConclaveError> {
        let plan = self.store.get_plan(plan_id).await?;
        let graph = StepGraph::build(&plan.steps)?;
        let limit = self.config.max_concurrency.max(1);
        let budget = tokio::time::sleep_until(Instant::now() + self.config.plan_budget());
        tokio::pin!(budget);

        let mut agents: HashMap<String, AgentHandle> = HashMap::new();
        let mut running: JoinSet<StepRun> = JoinSet::new();
        let mut in_flight: HashSet<StepId> = HashSet::new();
        let mut orphans: HashSet<StepId> = if reclaim {
            plan.steps
                .iter()
                .filter(|s| s.status == StepStatus::Running)
                .map(|s| s.step_id.clone())
                .collect()
        } else {
            HashSet::new()
        };

        info!(
            plan_id = %plan_id,
            version = plan.version,
            steps = plan.steps.len(),
            orphans = orphans.len(),
            "Executing plan"
        );
        self.publish(WorkflowEvent::plan(EventKind::PlanStarted, plan_id, "running"))
            .await;

        let halt = loop {
            if cancel.is_cancelled() {
                break Halt::Cancelled;
            }

            let steps = self.store.list_steps(plan_id).await?;
            if steps.iter().all(Step::is_terminal) {
                break Halt::Finished;
            }
            if self.apply_transitions(plan_id, &graph, &steps).await? {
                continue;
            }

            for step in &steps {
                if in_flight.len() >= limit {
                    break;
                }
                let expected = match step.status {
                    StepStatus::Ready => StepStatus::Ready,
                    StepStatus::Running if orphans.remove(&step.step_id) => StepStatus::Running,
                    _ => continue,
                };
                let Some(claimed) = self.claim(plan_id, step, expected).await? else {
                    continue;
                };

                in_flight.insert(claimed.step_id.clone());
                let inputs = dependency_outputs(&graph, &steps, &claimed);
                self.launch(&mut running, &mut agents, plan_id, request, claimed, inputs);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Halt::Cancelled,
                _ = &mut budget => break Halt::BudgetExceeded,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Ok(run) => {
                            in_flight.remove(&run.claimed.step_id);
                            self.record(plan_id, run).await?;
                        }
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(e) => debug!(error = %e, "Step task ended without a result"),
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        };

        let (cancelled, budget_exceeded) = match halt {
            Halt::Finished => (false, false),
            Halt::Cancelled => {
                info!(plan_id = %plan_id, in_flight = running.len(), "Plan cancelled");
                self.skip_unstarted(plan_id, "plan cancelled").await?;
                while let Some(joined) = running.join_next().await {
                    match joined {
                        Ok(run) => {
                            debug!(step_id = %run.claimed.step_id, "Discarding result of cancelled plan");
                        }
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(_) => {}
                    }
                }
                self.skip_remaining(plan_id, "plan cancelled").await?;
                (true, false)
            }
            Halt::BudgetExceeded => {
                warn!(
                    plan_id = %plan_id,
                    budget_ms = self.config.plan_budget_ms,
                    in_flight = running.len(),
                    "Plan budget exhausted, aborting remaining steps"
                );
                running.shutdown().await;
                self.skip_remaining(plan_id, "plan budget exhausted").await?;
                (false, true)
            }
        };

        let steps = self.store.list_steps(plan_id).await?;
        let status = classify_plan(&graph, &steps);

        let mut usage = TokenUsage::default();
        for (agent_type, agent) in &agents {
            let spent = agent.usage();
            info!(
                plan_id = %plan_id,
                agent_type = %agent_type,
                calls = agent.calls(),
                input_tokens = spent.input_tokens,
                output_tokens = spent.output_tokens,
                "Agent usage"
            );
            usage.add(&spent);
        }
        info!(plan_id = %plan_id, status = %status, total_tokens = usage.total_tokens, "Plan finished");

        Ok(ExecutionSummary {
            plan_id,
            status,
            steps,
            cancelled,
            budget_exceeded,
            usage,
        })
    }

    /// Apply `evaluate`'s decisions. Returns true if anything changed.
    async fn apply_transitions(
        &self,
        plan_id: PlanId,
        graph: &StepGraph,
        steps: &[Step],
    ) -> Result<bool, ConclaveError> {
        let transitions = evaluate(graph, steps);
        if transitions.is_empty() {
            return Ok(false);
        }

        let mut current: HashMap<StepId, Step> =
            steps.iter().map(|s| (s.step_id.clone(), s.clone())).collect();
        for transition in transitions {
            let (id, next) = match &transition {
                Transition::Promote(id) => (id, StepStatus::Ready),
                Transition::Skip(id, _) => (id, StepStatus::Skipped),
            };
            let Some(step) = current.get(id) else {
                continue;
            };
            let updated = match &transition {
                Transition::Promote(_) => step.advance(next)?,
                Transition::Skip(_, reason) => {
                    step.skip(StepError::new(FailureKind::Unreachable, reason.clone()))?
                }
            };

            match self
                .store
                .conditional_update_step(plan_id, id, StepStatus::Pending, updated.clone())
                .await
            {
                Ok(saved) => {
                    debug!(plan_id = %plan_id, step_id = %id, status = %saved.status, "Step re-evaluated");
                    if let Transition::Skip(_, reason) = &transition {
                        info!(plan_id = %plan_id, step_id = %id, reason = %reason, "Step skipped");
                        self.publish(WorkflowEvent::step(
                            EventKind::StepSkipped,
                            plan_id,
                            id.clone(),
                            StepStatus::Skipped,
                        ))
                        .await;
                    }
                    current.insert(id.clone(), saved);
                }
                Err(StoreError::Conflict { actual, .. }) => {
                    debug!(plan_id = %plan_id, step_id = %id, actual = %actual, "Step changed concurrently");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Conditionally move a step to `Running`; `None` if another executor won
    async fn claim(
        &self,
        plan_id: PlanId,
        step: &Step,
        expected: StepStatus,
    ) -> Result<Option<Step>, ConclaveError> {
        let running = step.advance(StepStatus::Running)?;
        match self
            .store
            .conditional_update_step(plan_id, &step.step_id, expected, running)
            .await
        {
            Ok(claimed) => {
                info!(
                    plan_id = %plan_id,
                    step_id = %claimed.step_id,
                    agent_type = %claimed.agent_type,
                    reclaimed = expected == StepStatus::Running,
                    "Step claimed"
                );
                self.publish(WorkflowEvent::step(
                    EventKind::StepStarted,
                    plan_id,
                    claimed.step_id.clone(),
                    StepStatus::Running,
                ))
                .await;
                Ok(Some(claimed))
            }
            Err(StoreError::Conflict { actual, .. }) => {
                debug!(plan_id = %plan_id, step_id = %step.step_id, actual = %actual, "Lost claim race");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn launch(
        &self,
        running: &mut JoinSet<StepRun>,
        agents: &mut HashMap<String, AgentHandle>,
        plan_id: PlanId,
        request: &WorkflowRequest,
        claimed: Step,
        inputs: BTreeMap<StepId, String>,
    ) {
        let agent = match agents.get(&claimed.agent_type).cloned() {
            Some(agent) => Ok(agent),
            None => self.registry.resolve(&claimed.agent_type).map(|descriptor| {
                let agent = AgentHandle::new(Agent::new(descriptor, Arc::clone(&self.client)));
                agents.insert(claimed.agent_type.clone(), agent.clone());
                agent
            }),
        };
        let prepared = agent
            .map_err(|e| StepError::new(FailureKind::UnknownAgent, e.to_string()))
            .and_then(|agent| {
                template::render(&claimed.input_template, request, &inputs)
                    .map(|input| (agent, input))
                    .map_err(|e| StepError::new(FailureKind::Template, e.to_string()))
            });
        let context = format!("{plan_id}/{}", claimed.step_id);

        running.spawn(async move {
            match prepared {
                Ok((agent, input)) => match agent.run(&input, &context).await {
                    Ok(output) => StepRun {
                        attempts: output.attempts,
                        outcome: Ok(output),
                        claimed,
                    },
                    Err(failure) => StepRun {
                        attempts: failure.attempts,
                        outcome: Err(step_error(&failure)),
                        claimed,
                    },
                },
                Err(error) => StepRun {
                    claimed,
                    outcome: Err(error),
                    attempts: 0,
                },
            }
        });
    }

    /// Write a finished step, then announce it
    async fn record(&self, plan_id: PlanId, run: StepRun) -> Result<(), ConclaveError> {
        let StepRun {
            claimed,
            outcome,
            attempts,
        } = run;
        let (next, kind) = match outcome {
            Ok(output) => (
                claimed.succeed(
                    StepOutput {
                        text: output.text,
                        token_usage: output.token_usage,
                        latency_ms: output.latency_ms,
                    },
                    attempts,
                )?,
                EventKind::StepCompleted,
            ),
            Err(error) => {
                warn!(
                    plan_id = %plan_id,
                    step_id = %claimed.step_id,
                    attempts,
                    error = %error,
                    "Step failed"
                );
                (claimed.fail(error, attempts)?, EventKind::StepFailed)
            }
        };

        match self
            .store
            .conditional_update_step(plan_id, &claimed.step_id, StepStatus::Running, next)
            .await
        {
            Ok(saved) => {
                info!(
                    plan_id = %plan_id,
                    step_id = %saved.step_id,
                    status = %saved.status,
                    attempts = saved.attempt_count,
                    "Step finished"
                );
                self.publish(WorkflowEvent::step(kind, plan_id, saved.step_id, saved.status))
                    .await;
                Ok(())
            }
            Err(StoreError::Conflict { actual, .. }) => {
                debug!(plan_id = %plan_id, step_id = %claimed.step_id, actual = %actual, "Step no longer running, result discarded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Skip every `Pending` and `Ready` step
    async fn skip_unstarted(&self, plan_id: PlanId, reason: &str) -> Result<(), ConclaveError> {
        for step in self.store.list_steps(plan_id).await? {
            if matches!(step.status, StepStatus::Pending | StepStatus::Ready) {
                self.discard(plan_id, step, reason).await?;
            }
        }
        Ok(())
    }

    /// Skip every non-terminal step, running ones included
    async fn skip_remaining(&self, plan_id: PlanId, reason: &str) -> Result<(), ConclaveError> {
        for step in self.store.list_steps(plan_id).await? {
            if !step.is_terminal() {
                self.discard(plan_id, step, reason).await?;
            }
        }
        Ok(())
    }

    async fn discard(&self, plan_id: PlanId, mut step: Step, reason: &str) -> Result<(), ConclaveError> {
        loop {
            let expected = step.status;
            let skipped = step.skip(StepError::new(FailureKind::Discarded, reason))?;
            match self
                .store
                .conditional_update_step(plan_id, &step.step_id, expected, skipped)
                .await
            {
                Ok(saved) => {
                    self.publish(WorkflowEvent::step(
                        EventKind::StepSkipped,
                        plan_id,
                        saved.step_id,
                        StepStatus::Skipped,
                    ))
                    .await;
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => {
                    step = self.store.get_step(plan_id, &step.step_id).await?;
                    if step.is_terminal() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn publish(&self, event: WorkflowEvent) {
        let kind = event.kind;
        if let Err(e) = self.events.publish(event).await {
            warn!(event = %kind, error = %e, "Failed to publish event");
        }
    }
}

fn step_error(failure: &InvocationFailure) -> StepError {
    let kind = if failure.error.is_transient() {
        FailureKind::RetriesExhausted
    } else {
        FailureKind::Permanent
    };
    StepError::new(kind, failure.to_string())
}

/// Effective outputs of `step`'s dependencies, keyed by dependency id
fn dependency_outputs(graph: &StepGraph, steps: &[Step], step: &Step) -> BTreeMap<StepId, String> {
    let by_id: HashMap<&StepId, &Step> = steps.iter().map(|s| (&s.step_id, s)).collect();
    step.dependencies
        .iter()
        .filter_map(|dep| {
            effective_output(graph, &by_id, dep).map(|output| (dep.clone(), output.text.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str], status: StepStatus) -> Step {
        let mut step = deps
            .iter()
            .fold(Step::new(id, "generic", "x"), |s, d| s.depends_on(*d));
        step.status = status;
        if status == StepStatus::Succeeded {
            step.output = Some(StepOutput {
                text: format!("out-{id}"),
                token_usage: TokenUsage::default(),
                latency_ms: 0,
            });
        }
        step
    }

    fn fallback(id: &str, primary: &str, status: StepStatus) -> Step {
        let mut s = step(id, &[], status);
        s.fallback_for = Some(StepId::from(primary));
        s
    }

    // === Evaluation Tests ===

    #[test]
    fn test_promotes_when_dependencies_succeed() {
        let steps = vec![
            step("a", &[], StepStatus::Succeeded),
            step("b", &["a"], StepStatus::Pending),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        assert_eq!(evaluate(&graph, &steps), vec![Transition::Promote("b".into())]);
    }

    #[test]
    fn test_waits_on_running_dependency() {
        let steps = vec![
            step("a", &[], StepStatus::Running),
            step("b", &["a"], StepStatus::Pending),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        assert!(evaluate(&graph, &steps).is_empty());
    }

    #[test]
    fn test_skip_cascades_in_one_pass() {
        let steps = vec![
            step("a", &[], StepStatus::Failed),
            step("b", &["a"], StepStatus::Pending),
            step("c", &["b"], StepStatus::Pending),
            step("d", &[], StepStatus::Running),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        let transitions = evaluate(&graph, &steps);

        assert_eq!(transitions.len(), 2);
        assert!(transitions
            .iter()
            .all(|t| matches!(t, Transition::Skip(..))));
    }

    #[test]
    fn test_fallback_runs_only_on_failure() {
        let failed = vec![
            step("a", &[], StepStatus::Failed),
            fallback("a-alt", "a", StepStatus::Pending),
            step("b", &["a"], StepStatus::Pending),
        ];
        let graph = StepGraph::build(&failed).unwrap();
        assert_eq!(evaluate(&graph, &failed), vec![Transition::Promote("a-alt".into())]);

        let succeeded = vec![
            step("a", &[], StepStatus::Succeeded),
            fallback("a-alt", "a", StepStatus::Pending),
            step("b", &["a"], StepStatus::Pending),
        ];
        let graph = StepGraph::build(&succeeded).unwrap();
        let transitions = evaluate(&graph, &succeeded);
        assert_eq!(transitions.len(), 2);
        assert!(transitions.contains(&Transition::Promote("b".into())));
        assert!(transitions
            .iter()
            .any(|t| matches!(t, Transition::Skip(id, _) if id.as_str() == "a-alt")));
    }

    #[test]
    fn test_fallback_output_satisfies_dependents() {
        let steps = vec![
            step("a", &[], StepStatus::Failed),
            fallback("a-alt", "a", StepStatus::Succeeded),
            step("b", &["a"], StepStatus::Pending),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        assert_eq!(evaluate(&graph, &steps), vec![Transition::Promote("b".into())]);

        let inputs = dependency_outputs(&graph, &steps, &steps[2]);
        assert_eq!(inputs.get(&StepId::from("a")).map(String::as_str), Some("out-a-alt"));
    }

    #[test]
    fn test_failed_fallback_cascades() {
        let steps = vec![
            step("a", &[], StepStatus::Failed),
            fallback("a-alt", "a", StepStatus::Failed),
            step("b", &["a"], StepStatus::Pending),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        assert!(matches!(&evaluate(&graph, &steps)[..], [Transition::Skip(id, reason)]
            if id.as_str() == "b" && reason.contains("fallback")));
    }

    // === Classification Tests ===

    #[test]
    fn test_classify_completed() {
        let steps = vec![
            step("a", &[], StepStatus::Succeeded),
            step("b", &["a"], StepStatus::Succeeded),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        assert_eq!(classify_plan(&graph, &steps), ResultStatus::Completed);
    }

    #[test]
    fn test_classify_completed_through_fallback() {
        let steps = vec![
            step("a", &[], StepStatus::Failed),
            fallback("a-alt", "a", StepStatus::Succeeded),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        assert_eq!(classify_plan(&graph, &steps), ResultStatus::Completed);
    }

    #[test]
    fn test_classify_skipped_leaf_is_partial() {
        let steps = vec![
            step("f1", &[], StepStatus::Succeeded),
            step("f2", &[], StepStatus::Failed),
            step("f3", &[], StepStatus::Succeeded),
            step("sum", &["f1", "f2", "f3"], StepStatus::Skipped),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        assert_eq!(classify_plan(&graph, &steps), ResultStatus::PartiallyCompleted);
    }

    #[test]
    fn test_classify_failed_leaves() {
        let steps = vec![
            step("a", &[], StepStatus::Succeeded),
            step("b", &["a"], StepStatus::Failed),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        assert_eq!(classify_plan(&graph, &steps), ResultStatus::Failed);

        let nothing = vec![step("a", &[], StepStatus::Skipped)];
        let graph = StepGraph::build(&nothing).unwrap();
        assert_eq!(classify_plan(&graph, &nothing), ResultStatus::Failed);
    }
}
