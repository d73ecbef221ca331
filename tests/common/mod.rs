#![allow(dead_code)]

use std::sync::Arc;

use conclave::testing::ScriptedTransport;
use conclave::{
    AgentRegistry, ChannelEventBus, ConclaveConfig, InMemoryStateStore, Orchestrator,
};

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<InMemoryStateStore>,
    pub bus: Arc<ChannelEventBus>,
}

pub fn harness(transport: ScriptedTransport) -> Harness {
    harness_with(ConclaveConfig::default(), transport)
}

pub fn harness_with(config: ConclaveConfig, transport: ScriptedTransport) -> Harness {
    harness_on(config, transport, Arc::new(InMemoryStateStore::new()))
}

/// Orchestrator over an existing store, as a restarted process would see it
pub fn harness_on(
    config: ConclaveConfig,
    transport: ScriptedTransport,
    store: Arc<InMemoryStateStore>,
) -> Harness {
    let transport = Arc::new(transport);
    let bus = Arc::new(ChannelEventBus::new());
    let registry = AgentRegistry::with_builtin_agents(&config.invocation);
    let orchestrator = Orchestrator::new(
        config,
        registry,
        transport.clone(),
        store.clone(),
        bus.clone(),
    )
    .expect("valid config");

    Harness {
        orchestrator,
        transport,
        store,
        bus,
    }
}

pub fn config_with(max_concurrency: usize, plan_budget_ms: u64) -> ConclaveConfig {
    let mut config = ConclaveConfig::default();
    config.executor.max_concurrency = max_concurrency;
    config.executor.plan_budget_ms = plan_budget_ms;
    config
}
