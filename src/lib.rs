//! # Conclave
//!
//! Multi-agent workflow orchestration - plan, run and synthesize.
//!
//! A caller's request is turned into a plan: a DAG of steps, each bound to
//! one agent type. The executor runs the DAG against a durable state store,
//! independent steps in parallel, and the synthesizer folds the step outputs
//! into a single result.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         ORCHESTRATOR                          │
//! │ submit / get_status / get_result / wait / cancel / replan     │
//! └───────┬─────────────────────┬─────────────────────┬───────────┘
//!         ▼                     ▼                     ▼
//! ┌───────────────┐     ┌───────────────┐     ┌───────────────┐
//! │    Planner    │────▶│   Executor    │────▶│  Synthesizer  │
//! │ template, LLM │     │ DAG, bounded  │     │ final, concat │
//! │  or fallback  │     │  parallelism  │     │  or summarize │
//! └───────┬───────┘     └───┬───────┬───┘     └───────┬───────┘
//!         ▼                 ▼       ▼                 ▼
//! ┌───────────────────────────┐ ┌───────┐ ┌─────────────────────┐
//! │ Agent Registry + Client   │ │ State │ │      Event Bus      │
//! │ (retry, backoff, timeout) │ │ Store │ │ (write, then notify)│
//! └───────────────────────────┘ └───────┘ └─────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: an agent type's configuration bound to the invocation client
//! - **Plan**: versioned DAG of steps derived from one request
//! - **Step**: one unit of work, `Pending → Ready → Running → Succeeded |
//!   Failed`, or `Skipped` when it can no longer run
//! - **Critical path**: steps nothing depends on; they feed the final result
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod invocation;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod run;
pub mod store;
pub mod synthesizer;
pub mod template;
pub mod testing;
pub mod types;

pub use agent::{Agent, AgentHandle};
pub use config::{ConclaveConfig, ExecutorConfig, InvocationConfig, PlannerConfig};
pub use error::{BusError, ConclaveError, InvocationError, InvocationFailure, StoreError};
pub use events::{ChannelEventBus, EventBus, EventKind, EventSubscription, WorkflowEvent};
pub use executor::{ExecutionSummary, WorkflowExecutor};
pub use graph::StepGraph;
pub use invocation::{GeneratedOutput, InvocationClient, InvocationRequest, LlmTransport, TransportResponse};
pub use orchestrator::{Orchestrator, StatusReport, StepSummary};
pub use planner::{WorkflowPlanner, WorkflowTemplate};
pub use registry::{AgentDescriptor, AgentRegistry, RetryPolicy};
pub use run::{CancelToken, RunState};
pub use store::{InMemoryStateStore, StateStore};
pub use synthesizer::ResultSynthesizer;

// Commonly used data types
pub use types::{
    PlanId, RequestId, ResultStatus, Step, StepId, StepOutput, StepStatus, SynthesisStrategy,
    TokenUsage, WorkflowPlan, WorkflowRequest, WorkflowResult,
};
