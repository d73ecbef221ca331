//! Invocation client - timeout, retry and backoff around an LLM transport

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{InvocationError, InvocationFailure};
use crate::registry::{AgentDescriptor, RetryPolicy};
use crate::types::TokenUsage;

/// A single call as sent to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub model_id: String,
    pub system_instructions: String,
    pub input_text: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// Correlation id for logs and traces, e.g. `"<plan>/<step>"`
    pub correlation_id: String,
}

impl InvocationRequest {
    pub fn from_descriptor(descriptor: &AgentDescriptor, input_text: &str, context: &str) -> Self {
        Self {
            model_id: descriptor.model_id.clone(),
            system_instructions: descriptor.system_instructions.clone(),
            input_text: input_text.to_string(),
            max_tokens: descriptor.max_tokens,
            timeout: descriptor.timeout(),
            correlation_id: context.to_string(),
        }
    }
}

/// Raw provider answer
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub generated_text: String,
    pub token_usage: TokenUsage,
    pub latency_ms: u64,
}

/// Connection to the external LLM invocation service.
///
/// Implementations perform exactly one remote call per `complete`; retrying
/// is the client's job.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(
        &self,
        request: &InvocationRequest,
    ) -> Result<TransportResponse, InvocationError>;
}

/// Successful invocation with observability metadata
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedOutput {
    pub text: String,
    pub token_usage: TokenUsage,
    /// Provider-reported latency of the successful call
    pub latency_ms: u64,
    /// Calls made, including the successful one
    pub attempts: u32,
}

/// Computes the wait between attempts
#[derive(Debug, Clone, Default)]
pub struct Backoff;

impl Backoff {
    /// Delay after failed attempt `attempt` (1-based).
    ///
    /// With jitter the delay is drawn from the upper half of the exponential
    /// value, so it never exceeds the policy cap. A provider `retry_after`
    /// hint raises the delay, still bounded by the cap.
    pub fn delay(
        &self,
        policy: &RetryPolicy,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> Duration {
        let base = policy.delay_for(attempt);
        let delay = if policy.jitter {
            let half = base.as_millis() as u64 / 2;
            let extra = rand::thread_rng().gen_range(0..=half);
            Duration::from_millis(base.as_millis() as u64 - half + extra)
        } else {
            base
        };

        match retry_after {
            Some(hint) => delay.max(hint.min(policy.max_delay())),
            None => delay,
        }
    }
}

/// Uniform client used by every agent
pub struct InvocationClient {
    transport: Arc<dyn LlmTransport>,
    backoff: Backoff,
}

impl InvocationClient {
    pub fn new(transport: Arc<dyn LlmTransport>) -> Self {
        Self {
            transport,
            backoff: Backoff,
        }
    }

    /// Invoke the agent described by `descriptor` on `input_text`.
    ///
    /// Transient failures (rate limits, timeouts, provider outages) are
    /// retried up to `retry_policy.max_attempts` calls in total; permanent
    /// ones fail at once.
    #[instrument(skip(self, descriptor, input_text), fields(agent_type = %descriptor.agent_type))]
    pub async fn invoke(
        &self,
        descriptor: &AgentDescriptor,
        input_text: &str,
        context: &str,
    ) -> Result<GeneratedOutput, InvocationFailure> {
        let policy = &descriptor.retry_policy;
        let max_attempts = policy.max_attempts.max(1);
        let request = InvocationRequest::from_descriptor(descriptor, input_text, context);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();

            let outcome =
                match tokio::time::timeout(request.timeout, self.transport.complete(&request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(InvocationError::Timeout(request.timeout)),
                };

            match outcome {
                Ok(response) => {
                    debug!(
                        attempt,
                        latency_ms = response.latency_ms,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        tokens = response.token_usage.total_tokens,
                        "Invocation succeeded"
                    );
                    return Ok(GeneratedOutput {
                        text: response.generated_text,
                        token_usage: response.token_usage,
                        latency_ms: response.latency_ms,
                        attempts: attempt,
                    });
                }
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let retry_after = match &error {
                        InvocationError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = self.backoff.delay(policy, attempt, retry_after);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient invocation failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(attempt, error = %error, "Invocation failed");
                    return Err(InvocationFailure {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Scripted, ScriptedTransport};

    fn descriptor(max_attempts: u32) -> AgentDescriptor {
        AgentDescriptor::new("fetch", "fetch things").with_retry_policy(RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = InvocationClient::new(transport.clone());

        let output = client.invoke(&descriptor(3), "hello", "p/s1").await.unwrap();
        assert_eq!(output.attempts, 1);
        assert!(output.text.contains("hello"));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::new().script(
            "s1",
            vec![
                Scripted::Fail(InvocationError::RateLimited { retry_after: None }),
                Scripted::Fail(InvocationError::Unavailable("503".into())),
                Scripted::Reply("done".into()),
            ],
        ));
        let client = InvocationClient::new(transport.clone());

        let output = client.invoke(&descriptor(3), "go", "p/s1").await.unwrap();
        assert_eq!(output.text, "done");
        assert_eq!(output.attempts, 3);
        assert_eq!(transport.calls_for("s1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries() {
        let transport = Arc::new(ScriptedTransport::new().always(
            "s1",
            Scripted::Fail(InvocationError::Unavailable("500".into())),
        ));
        let client = InvocationClient::new(transport.clone());

        let failure = client.invoke(&descriptor(4), "go", "p/s1").await.unwrap_err();
        assert_eq!(failure.attempts, 4);
        assert!(matches!(failure.error, InvocationError::Unavailable(_)));
        assert_eq!(transport.calls_for("s1"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let transport = Arc::new(ScriptedTransport::new().always(
            "s1",
            Scripted::Fail(InvocationError::Permanent("content rejected".into())),
        ));
        let client = InvocationClient::new(transport.clone());

        let failure = client.invoke(&descriptor(5), "go", "p/s1").await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert!(!failure.error.is_transient());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let transport = Arc::new(ScriptedTransport::new().script(
            "s1",
            vec![
                Scripted::Delay(Duration::from_secs(60), Box::new(Scripted::Reply("late".into()))),
                Scripted::Reply("on time".into()),
            ],
        ));
        let client = InvocationClient::new(transport.clone());
        let descriptor = descriptor(2).with_timeout(Duration::from_secs(5));

        let output = client.invoke(&descriptor, "go", "p/s1").await.unwrap();
        assert_eq!(output.text, "on time");
        assert_eq!(output.attempts, 2);
    }

    #[test]
    fn test_backoff_within_bounds() {
        let policy = RetryPolicy::default();
        let backoff = Backoff;
        for attempt in 1..8 {
            let expected = policy.delay_for(attempt);
            let delay = backoff.delay(&policy, attempt, None);
            assert!(delay <= expected);
            assert!(delay >= expected / 2);
            assert!(delay <= policy.max_delay());
        }
    }

    #[test]
    fn test_backoff_honors_retry_after() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let delay = Backoff.delay(&policy, 1, Some(Duration::from_secs(3)));
        assert_eq!(delay, Duration::from_secs(3));

        let capped = Backoff.delay(&policy, 1, Some(Duration::from_secs(60)));
        assert_eq!(capped, policy.max_delay());
    }
}
