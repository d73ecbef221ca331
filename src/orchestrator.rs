//! Main orchestrator - the caller-facing API
//!
//! Each submitted request becomes a run: plan, execute, synthesize. Runs
//! proceed in the background; callers poll `get_status`, fetch the result
//! with `get_result` or await it with `wait`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConclaveConfig;
use crate::error::ConclaveError;
use crate::events::{EventBus, EventKind, WorkflowEvent};
use crate::executor::WorkflowExecutor;
use crate::invocation::{InvocationClient, LlmTransport};
use crate::planner::WorkflowPlanner;
use crate::registry::AgentRegistry;
use crate::run::{PlanRun, RunHandle, RunState};
use crate::store::StateStore;
use crate::synthesizer::ResultSynthesizer;
use crate::types::{
    PlanId, RequestId, StepId, StepStatus, WorkflowPlan, WorkflowRequest, WorkflowResult,
};

/// Per-step line of a status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: StepId,
    pub agent_type: String,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub error: Option<String>,
}

/// Answer to `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub request_id: RequestId,
    /// Current plan version, absent while planning or after a rejection
    pub plan_id: Option<PlanId>,
    pub version: Option<u32>,
    pub state: RunState,
    pub steps: Vec<StepSummary>,
}

enum Start {
    /// Plan the request, then run it
    Fresh,
    /// Run an already stored plan
    Execute(PlanId),
    /// Reattach to a plan left behind by a previous process
    Resume(PlanId),
}

struct Engine {
    registry: Arc<AgentRegistry>,
    planner: WorkflowPlanner,
    executor: WorkflowExecutor,
    synthesizer: ResultSynthesizer,
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventBus>,
    runs: RwLock<HashMap<RequestId, RunHandle>>,
}

/// The workflow orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Engine>,
}

impl Orchestrator {
    /// Create an orchestrator over the given transport, store and bus
    pub fn new(
        config: ConclaveConfig,
        registry: AgentRegistry,
        transport: Arc<dyn LlmTransport>,
        store: Arc<dyn StateStore>,
        events: Arc<dyn EventBus>,
    ) -> Result<Self, ConclaveError> {
        config.validate()?;
        let registry = Arc::new(registry);
        let client = Arc::new(InvocationClient::new(transport));

        info!(
            agents = registry.len(),
            max_concurrency = config.executor.max_concurrency,
            "Creating orchestrator"
        );

        let planner = WorkflowPlanner::new(
            Arc::clone(&registry),
            Arc::clone(&client),
            config.planner.clone(),
        );
        let executor = WorkflowExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&client),
            Arc::clone(&store),
            Arc::clone(&events),
            config.executor.clone(),
        );
        let synthesizer =
            ResultSynthesizer::new(Arc::clone(&registry), client, Arc::clone(&store));

        Ok(Self {
            inner: Arc::new(Engine {
                registry,
                planner,
                executor,
                synthesizer,
                store,
                events,
                runs: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    /// Accept a request and start it in the background.
    ///
    /// Idempotent per `request_id`: a repeat returns the same id without
    /// planning again, and a request with plans already in the store is
    /// picked up where it stopped.
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn submit(&self, request: WorkflowRequest) -> Result<RequestId, ConclaveError> {
        let request_id = request.request_id.clone();
        if self.inner.runs.read().contains_key(&request_id) {
            debug!("Request already submitted");
            return Ok(request_id);
        }

        let latest = self
            .inner
            .store
            .plans_for_request(&request_id)
            .await?
            .last()
            .copied();

        let run = {
            let mut runs = self.inner.runs.write();
            if runs.contains_key(&request_id) {
                return Ok(request_id);
            }
            let run = RunHandle::new(PlanRun::new(request));
            runs.insert(request_id.clone(), run.clone());
            run
        };

        let start = match latest {
            None => Start::Fresh,
            Some(plan_id) => {
                run.set_plan_id(plan_id);
                match self.inner.store.get_result(plan_id).await? {
                    Some(result) => {
                        info!(plan_id = %plan_id, "Request already finished");
                        run.finish(result);
                        return Ok(request_id);
                    }
                    None => {
                        info!(plan_id = %plan_id, "Picking up stored plan");
                        Start::Resume(plan_id)
                    }
                }
            }
        };

        self.spawn(run, start);
        Ok(request_id)
    }

    /// Submit and wait for the result
    pub async fn run(&self, request: WorkflowRequest) -> Result<WorkflowResult, ConclaveError> {
        let request_id = self.submit(request).await?;
        self.wait(&request_id).await
    }

    /// Wait until a submitted request is finished
    pub async fn wait(&self, request_id: &RequestId) -> Result<WorkflowResult, ConclaveError> {
        let run = self.get_run(request_id)?;
        run.done().await;
        self.get_result(request_id).await
    }

    pub async fn get_status(&self, request_id: &RequestId) -> Result<StatusReport, ConclaveError> {
        let run = self.get_run(request_id)?;
        let state = run.state();

        let (version, steps) = match run.plan_id() {
            Some(plan_id) => {
                let plan = self.inner.store.get_plan(plan_id).await?;
                let steps = plan
                    .steps
                    .iter()
                    .map(|s| StepSummary {
                        step_id: s.step_id.clone(),
                        agent_type: s.agent_type.clone(),
                        status: s.status,
                        attempt_count: s.attempt_count,
                        error: s.error.as_ref().map(|e| e.message.clone()),
                    })
                    .collect();
                (Some(plan.version), steps)
            }
            None => (None, Vec::new()),
        };

        Ok(StatusReport {
            request_id: request_id.clone(),
            plan_id: run.plan_id(),
            version,
            state,
            steps,
        })
    }

    /// The result, or `NotReady` while the plan is still going
    pub async fn get_result(&self, request_id: &RequestId) -> Result<WorkflowResult, ConclaveError> {
        let run = self.get_run(request_id)?;
        if let Some(result) = run.result() {
            return Ok(result);
        }
        if let RunState::Rejected(reason) = run.state() {
            return Err(ConclaveError::Rejected(request_id.clone(), reason));
        }
        if let Some(plan_id) = run.plan_id() {
            if let Some(result) = self.inner.store.get_result(plan_id).await? {
                return Ok(result);
            }
        }
        if let RunState::Failed(reason) = run.state() {
            return Err(ConclaveError::RunFailed(request_id.clone(), reason));
        }
        Err(ConclaveError::NotReady(request_id.clone()))
    }

    /// Stop dispatching new steps; the run still finishes with a result
    pub fn cancel(&self, request_id: &RequestId) -> Result<(), ConclaveError> {
        let run = self.get_run(request_id)?;
        info!(request_id = %request_id, state = %run.state(), "Cancelling request");
        run.cancel();
        Ok(())
    }

    /// Reattach to a stored plan, reclaiming steps left `Running`
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn resume(
        &self,
        request: WorkflowRequest,
        plan_id: PlanId,
    ) -> Result<RequestId, ConclaveError> {
        let plan = self.inner.store.get_plan(plan_id).await?;
        if plan.request_id != request.request_id {
            return Err(ConclaveError::PlanNotFound(plan_id));
        }

        let request_id = request.request_id.clone();
        let run = {
            let mut runs = self.inner.runs.write();
            match runs.get(&request_id).cloned() {
                Some(existing) => {
                    if existing.try_restart().is_none() {
                        return Err(ConclaveError::StillRunning(request_id));
                    }
                    existing
                }
                None => {
                    let run = RunHandle::new(PlanRun::new(request));
                    runs.insert(request_id.clone(), run.clone());
                    run
                }
            }
        };
        run.set_plan_id(plan_id);

        self.spawn(run, Start::Resume(plan_id));
        Ok(request_id)
    }

    /// Plan a finished request again and run the new version.
    ///
    /// The previous plan stays in the store; the new one records it as its
    /// parent. Only one replan of a request can be in flight; the others get
    /// `StillRunning`.
    #[instrument(skip(self))]
    pub async fn replan(&self, request_id: &RequestId) -> Result<PlanId, ConclaveError> {
        let run = self.get_run(request_id)?;
        let restarted = run
            .try_restart()
            .ok_or_else(|| ConclaveError::StillRunning(request_id.clone()))?;

        let plan = match self.inner.next_plan(&run).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Replanning failed");
                run.rollback(restarted);
                return Err(e);
            }
        };

        run.set_plan_id(plan.plan_id);
        self.spawn(run, Start::Execute(plan.plan_id));
        Ok(plan.plan_id)
    }

    /// Ids of every known request
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.inner.runs.read().keys().cloned().collect()
    }

    fn get_run(&self, request_id: &RequestId) -> Result<RunHandle, ConclaveError> {
        self.inner
            .runs
            .read()
            .get(request_id)
            .cloned()
            .ok_or_else(|| ConclaveError::RequestNotFound(request_id.clone()))
    }

    fn spawn(&self, run: RunHandle, start: Start) {
        let engine = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = engine.pipeline(&run, start).await {
                error!(request_id = %run.request_id(), error = %e, "Request pipeline failed");
                let state = match run.plan_id() {
                    Some(_) => RunState::Failed(e.to_string()),
                    None => RunState::Rejected(e.to_string()),
                };
                run.set_state(state);
            }
        });
    }
}

impl Engine {
    /// Plan the next version of a run's request and store it
    async fn next_plan(&self, run: &RunHandle) -> Result<WorkflowPlan, ConclaveError> {
        let plan = match run.plan_id() {
            Some(previous) => {
                let previous = self.store.get_plan(previous).await?;
                self.planner.replan(&run.request, &previous).await?
            }
            None => self.planner.plan(&run.request).await?,
        };
        self.store.put_plan(&plan).await?;
        Ok(plan)
    }

    async fn pipeline(&self, run: &RunHandle, start: Start) -> Result<(), ConclaveError> {
        let request = &run.request;
        let cancel = run.cancel_token();

        let (plan_id, reclaim) = match start {
            Start::Fresh => {
                let plan = self.planner.plan(request).await?;
                self.store.put_plan(&plan).await?;
                run.set_plan_id(plan.plan_id);
                (plan.plan_id, false)
            }
            Start::Execute(plan_id) => (plan_id, false),
            Start::Resume(plan_id) => (plan_id, true),
        };

        run.set_state(RunState::Running);
        let summary = if reclaim {
            self.executor.resume(plan_id, request, cancel).await?
        } else {
            self.executor.execute(plan_id, request, cancel).await?
        };
        if summary.cancelled || summary.budget_exceeded {
            warn!(
                plan_id = %plan_id,
                cancelled = summary.cancelled,
                budget_exceeded = summary.budget_exceeded,
                "Plan stopped early"
            );
        }

        run.set_state(RunState::Synthesizing);
        let result = self.synthesizer.synthesize(plan_id).await?;

        let event = WorkflowEvent::plan(EventKind::PlanCompleted, plan_id, result.status);
        if let Err(e) = self.events.publish(event).await {
            warn!(plan_id = %plan_id, error = %e, "Failed to publish event");
        }
        info!(
            request_id = %request.request_id,
            plan_id = %plan_id,
            status = %result.status,
            "Request finished"
        );
        run.finish(result);
        Ok(())
    }
}
