//! Per-request runtime context

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::types::{PlanId, RequestId, ResultStatus, WorkflowRequest, WorkflowResult};

/// Cooperative cancellation signal shared by a run and its executor
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a request is in its pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum RunState {
    Planning,
    Running,
    Synthesizing,
    Finished(ResultStatus),
    /// Planning rejected the request; no plan was stored
    Rejected(String),
    /// The stored plan could not be driven to a result
    Failed(String),
}

impl RunState {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Rejected(_) | Self::Failed(_))
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => f.write_str("planning"),
            Self::Running => f.write_str("running"),
            Self::Synthesizing => f.write_str("synthesizing"),
            Self::Finished(status) => write!(f, "finished ({status})"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// One request moving through plan, execute and synthesize
pub struct PlanRun {
    /// The request, immutable
    pub request: WorkflowRequest,
    /// Current plan version, once planning succeeded
    plan_id: RwLock<Option<PlanId>>,
    state: watch::Sender<RunState>,
    cancel: RwLock<CancelToken>,
    result: RwLock<Option<WorkflowResult>>,
}

impl PlanRun {
    pub fn new(request: WorkflowRequest) -> Self {
        info!(request_id = %request.request_id, "Creating run");
        let (state, _rx) = watch::channel(RunState::Planning);

        Self {
            request,
            plan_id: RwLock::new(None),
            state,
            cancel: RwLock::new(CancelToken::new()),
            result: RwLock::new(None),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request.request_id
    }

    pub fn plan_id(&self) -> Option<PlanId> {
        *self.plan_id.read()
    }

    pub fn set_plan_id(&self, plan_id: PlanId) {
        *self.plan_id.write() = Some(plan_id);
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn set_state(&self, state: RunState) {
        debug!(request_id = %self.request.request_id, state = %state, "Run state changed");
        self.state.send_replace(state);
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.read().clone()
    }

    pub fn cancel(&self) {
        self.cancel.read().cancel();
    }

    /// Claim a finished run for another attempt (replan or resume).
    ///
    /// The done check and the move back to `Planning` happen as one step, so
    /// of several concurrent callers exactly one gets `Some`. The returned
    /// `Restarted` carries what `rollback` needs if the attempt never starts.
    pub fn try_restart(&self) -> Option<Restarted> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if !state.is_done() {
                return false;
            }
            previous = Some(std::mem::replace(state, RunState::Planning));
            true
        });
        let previous = previous?;

        debug!(request_id = %self.request.request_id, previous = %previous, "Run restarted");
        let token = CancelToken::new();
        *self.cancel.write() = token.clone();
        let result = self.result.write().take();
        Some(Restarted {
            token,
            previous,
            result,
        })
    }

    /// Undo a `try_restart` whose attempt could not be started
    pub fn rollback(&self, restarted: Restarted) {
        *self.result.write() = restarted.result;
        self.set_state(restarted.previous);
    }

    pub fn result(&self) -> Option<WorkflowResult> {
        self.result.read().clone()
    }

    pub fn finish(&self, result: WorkflowResult) {
        let status = result.status;
        *self.result.write() = Some(result);
        self.set_state(RunState::Finished(status));
    }

    /// Wait until the run is finished, rejected or failed
    pub async fn done(&self) -> RunState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(RunState::is_done).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }
}

/// A claimed restart, see `PlanRun::try_restart`
#[derive(Debug)]
pub struct Restarted {
    pub token: CancelToken,
    previous: RunState,
    result: Option<WorkflowResult>,
}

/// Shared handle to a run
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<PlanRun>,
}

impl RunHandle {
    pub fn new(run: PlanRun) -> Self {
        Self {
            inner: Arc::new(run),
        }
    }
}

impl std::ops::Deref for RunHandle {
    type Target = PlanRun;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
