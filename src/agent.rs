//! Agent - an agent type's configuration bound to the invocation client

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::error::InvocationFailure;
use crate::invocation::{GeneratedOutput, InvocationClient};
use crate::registry::AgentDescriptor;
use crate::types::TokenUsage;

/// A single capability in a workflow
pub struct Agent {
    /// Configuration
    descriptor: Arc<AgentDescriptor>,
    /// Shared invocation client
    client: Arc<InvocationClient>,
    /// Token usage across every run of this agent
    usage: RwLock<TokenUsage>,
    /// Provider calls made, retries included
    calls: RwLock<u64>,
}

impl Agent {
    /// Create a new agent
    pub fn new(descriptor: Arc<AgentDescriptor>, client: Arc<InvocationClient>) -> Self {
        debug!(agent_type = %descriptor.agent_type, model = %descriptor.model_id, "Creating agent");

        Self {
            descriptor,
            client,
            usage: RwLock::new(TokenUsage::default()),
            calls: RwLock::new(0),
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.descriptor.agent_type
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Run the agent on rendered input
    #[instrument(skip(self, input), fields(agent_type = %self.descriptor.agent_type))]
    pub async fn run(
        &self,
        input: &str,
        context: &str,
    ) -> Result<GeneratedOutput, InvocationFailure> {
        let result = self.client.invoke(&self.descriptor, input, context).await;

        let attempts = match &result {
            Ok(output) => {
                self.add_usage(&output.token_usage);
                output.attempts
            }
            Err(failure) => failure.attempts,
        };
        *self.calls.write() += u64::from(attempts);

        result
    }

    /// Update token usage
    pub fn add_usage(&self, usage: &TokenUsage) {
        self.usage.write().add(usage);
    }

    /// Get token usage
    pub fn usage(&self) -> TokenUsage {
        *self.usage.read()
    }

    /// Provider calls made so far
    pub fn calls(&self) -> u64 {
        *self.calls.read()
    }
}

/// Shared handle to an agent
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<Agent>,
}

impl AgentHandle {
    pub fn new(agent: Agent) -> Self {
        Self {
            inner: Arc::new(agent),
        }
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = Agent;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
