//! Durable state store contract and an in-memory implementation

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::types::{PlanId, RequestId, Step, StepId, StepStatus, WorkflowPlan, WorkflowResult};

/// Source of truth for plan and step state.
///
/// Step writes are conditional on the status the writer last observed, which
/// makes claims race-safe across executor instances.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a new plan with its initial step states
    async fn put_plan(&self, plan: &WorkflowPlan) -> Result<(), StoreError>;

    /// Plan with the current state of every step
    async fn get_plan(&self, plan_id: PlanId) -> Result<WorkflowPlan, StoreError>;

    /// All plan versions created for a request, oldest first
    async fn plans_for_request(&self, request_id: &RequestId) -> Result<Vec<PlanId>, StoreError>;

    async fn get_step(&self, plan_id: PlanId, step_id: &StepId) -> Result<Step, StoreError>;

    /// Replace a step if its stored status equals `expected_status`.
    ///
    /// Fails with `Conflict` otherwise, and with `InvalidTransition` if the
    /// new state is not a legal successor.
    async fn conditional_update_step(
        &self,
        plan_id: PlanId,
        step_id: &StepId,
        expected_status: StepStatus,
        new_state: Step,
    ) -> Result<Step, StoreError>;

    /// Steps of a plan in plan order
    async fn list_steps(&self, plan_id: PlanId) -> Result<Vec<Step>, StoreError>;

    /// Persist the final result; fails with `AlreadyExists` on a second write
    async fn put_result(&self, result: &WorkflowResult) -> Result<(), StoreError>;

    async fn get_result(&self, plan_id: PlanId) -> Result<Option<WorkflowResult>, StoreError>;
}

#[derive(Debug, Clone)]
struct PlanRecord {
    plan: WorkflowPlan,
    result: Option<WorkflowResult>,
}

/// Process-local store backed by a lock-protected map
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    plans: RwLock<HashMap<PlanId, PlanRecord>>,
    by_request: RwLock<HashMap<RequestId, Vec<PlanId>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored plans
    pub fn plan_count(&self) -> usize {
        self.plans.read().len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put_plan(&self, plan: &WorkflowPlan) -> Result<(), StoreError> {
        let mut plans = self.plans.write();
        if plans.contains_key(&plan.plan_id) {
            return Err(StoreError::AlreadyExists(format!("plan {}", plan.plan_id)));
        }
        plans.insert(
            plan.plan_id,
            PlanRecord {
                plan: plan.clone(),
                result: None,
            },
        );
        self.by_request
            .write()
            .entry(plan.request_id.clone())
            .or_default()
            .push(plan.plan_id);

        debug!(plan_id = %plan.plan_id, version = plan.version, steps = plan.steps.len(), "Stored plan");
        Ok(())
    }

    async fn get_plan(&self, plan_id: PlanId) -> Result<WorkflowPlan, StoreError> {
        self.plans
            .read()
            .get(&plan_id)
            .map(|record| record.plan.clone())
            .ok_or_else(|| StoreError::NotFound(format!("plan {plan_id}")))
    }

    async fn plans_for_request(&self, request_id: &RequestId) -> Result<Vec<PlanId>, StoreError> {
        Ok(self
            .by_request
            .read()
            .get(request_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_step(&self, plan_id: PlanId, step_id: &StepId) -> Result<Step, StoreError> {
        let plans = self.plans.read();
        let record = plans
            .get(&plan_id)
            .ok_or_else(|| StoreError::NotFound(format!("plan {plan_id}")))?;
        record
            .plan
            .step(step_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("step {plan_id}/{step_id}")))
    }

    async fn conditional_update_step(
        &self,
        plan_id: PlanId,
        step_id: &StepId,
        expected_status: StepStatus,
        new_state: Step,
    ) -> Result<Step, StoreError> {
        if &new_state.step_id != step_id {
            return Err(StoreError::Backend(format!(
                "step id mismatch: {} vs {}",
                step_id, new_state.step_id
            )));
        }

        let mut plans = self.plans.write();
        let record = plans
            .get_mut(&plan_id)
            .ok_or_else(|| StoreError::NotFound(format!("plan {plan_id}")))?;
        let current = record
            .plan
            .steps
            .iter_mut()
            .find(|s| &s.step_id == step_id)
            .ok_or_else(|| StoreError::NotFound(format!("step {plan_id}/{step_id}")))?;

        if current.status != expected_status {
            return Err(StoreError::Conflict {
                step_id: step_id.clone(),
                expected: expected_status,
                actual: current.status,
            });
        }
        if !current.status.can_transition_to(new_state.status) {
            return Err(StoreError::InvalidTransition {
                step_id: step_id.clone(),
                from: current.status,
                to: new_state.status,
            });
        }

        *current = new_state;
        Ok(current.clone())
    }

    async fn list_steps(&self, plan_id: PlanId) -> Result<Vec<Step>, StoreError> {
        self.plans
            .read()
            .get(&plan_id)
            .map(|record| record.plan.steps.clone())
            .ok_or_else(|| StoreError::NotFound(format!("plan {plan_id}")))
    }

    async fn put_result(&self, result: &WorkflowResult) -> Result<(), StoreError> {
        let mut plans = self.plans.write();
        let record = plans
            .get_mut(&result.plan_id)
            .ok_or_else(|| StoreError::NotFound(format!("plan {}", result.plan_id)))?;
        if record.result.is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "result for plan {}",
                result.plan_id
            )));
        }
        record.result = Some(result.clone());
        Ok(())
    }

    async fn get_result(&self, plan_id: PlanId) -> Result<Option<WorkflowResult>, StoreError> {
        self.plans
            .read()
            .get(&plan_id)
            .map(|record| record.result.clone())
            .ok_or_else(|| StoreError::NotFound(format!("plan {plan_id}")))
    }
}
