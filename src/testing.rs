//! Deterministic fakes for running workflows without a live model provider

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::InvocationError;
use crate::invocation::{InvocationRequest, LlmTransport, TransportResponse};
use crate::types::TokenUsage;

/// One scripted answer
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(String),
    Fail(InvocationError),
    /// Wait, then behave like the inner entry
    Delay(Duration, Box<Scripted>),
}

#[derive(Debug, Default)]
struct Rule {
    queue: VecDeque<Scripted>,
    fallback: Option<Scripted>,
}

/// A call as seen by the transport
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Last segment of the correlation id (step id, `plan`, `synthesis`)
    pub key: String,
    pub correlation_id: String,
    pub model_id: String,
    pub input_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Started,
    Finished,
}

/// Transport answering from per-key scripts.
///
/// Calls are routed by the last `/`-separated segment of their correlation
/// id. Unscripted keys get an echo of their input.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    rules: Mutex<HashMap<String, Rule>>,
    latency: Duration,
    calls: Mutex<Vec<RecordedCall>>,
    timeline: Mutex<Vec<(String, CallPhase)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated latency added to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answers consumed in order for `key`, echo afterwards
    pub fn script(self, key: &str, outcomes: Vec<Scripted>) -> Self {
        self.rules
            .lock()
            .entry(key.to_string())
            .or_default()
            .queue
            .extend(outcomes);
        self
    }

    /// Answer used for `key` once its script is exhausted
    pub fn always(self, key: &str, outcome: Scripted) -> Self {
        self.rules.lock().entry(key.to_string()).or_default().fallback = Some(outcome);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.key == key).count()
    }

    /// Start/finish events in the order they happened
    pub fn timeline(&self) -> Vec<(String, CallPhase)> {
        self.timeline.lock().clone()
    }

    /// Most calls observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, key: &str, request: &InvocationRequest) -> Scripted {
        let mut rules = self.rules.lock();
        rules
            .get_mut(key)
            .and_then(|rule| rule.queue.pop_front().or_else(|| rule.fallback.clone()))
            .unwrap_or_else(|| Scripted::Reply(format!("{key}: {}", request.input_text)))
    }
}

struct InFlight<'a> {
    transport: &'a ScriptedTransport,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.transport.active.fetch_sub(1, Ordering::SeqCst);
        self.transport
            .timeline
            .lock()
            .push((std::mem::take(&mut self.key), CallPhase::Finished));
    }
}

#[async_trait]
impl LlmTransport for ScriptedTransport {
    async fn complete(
        &self,
        request: &InvocationRequest,
    ) -> Result<TransportResponse, InvocationError> {
        let key = request
            .correlation_id
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        self.calls.lock().push(RecordedCall {
            key: key.clone(),
            correlation_id: request.correlation_id.clone(),
            model_id: request.model_id.clone(),
            input_text: request.input_text.clone(),
        });
        self.timeline.lock().push((key.clone(), CallPhase::Started));
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let _guard = InFlight {
            transport: self,
            key: key.clone(),
        };

        let mut outcome = self.next_outcome(&key, request);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        loop {
            match outcome {
                Scripted::Delay(delay, next) => {
                    tokio::time::sleep(delay).await;
                    outcome = *next;
                }
                Scripted::Reply(text) => {
                    let input_tokens = request.input_text.split_whitespace().count() as u64;
                    let output_tokens = text.split_whitespace().count() as u64;
                    return Ok(TransportResponse {
                        generated_text: text,
                        token_usage: TokenUsage::new(input_tokens, output_tokens),
                        latency_ms: self.latency.as_millis() as u64,
                    });
                }
                Scripted::Fail(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(correlation_id: &str, input: &str) -> InvocationRequest {
        InvocationRequest {
            model_id: "test-model".into(),
            system_instructions: String::new(),
            input_text: input.into(),
            max_tokens: 100,
            timeout: Duration::from_secs(1),
            correlation_id: correlation_id.into(),
        }
    }

    #[tokio::test]
    async fn test_echo_when_unscripted() {
        let transport = ScriptedTransport::new();
        let response = transport.complete(&request("plan/a", "hi there")).await.unwrap();
        assert_eq!(response.generated_text, "a: hi there");
        assert_eq!(response.token_usage.input_tokens, 2);
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let transport = ScriptedTransport::new()
            .script("a", vec![Scripted::Reply("first".into())])
            .always("a", Scripted::Fail(InvocationError::Permanent("no".into())));

        let first = transport.complete(&request("p/a", "x")).await.unwrap();
        assert_eq!(first.generated_text, "first");
        assert!(transport.complete(&request("p/a", "x")).await.is_err());
        assert!(transport.complete(&request("p/a", "x")).await.is_err());
        assert_eq!(transport.calls_for("a"), 3);
        assert_eq!(transport.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_timeline_records_phases() {
        let transport = ScriptedTransport::new();
        transport.complete(&request("p/a", "x")).await.unwrap();
        assert_eq!(
            transport.timeline(),
            vec![
                ("a".to_string(), CallPhase::Started),
                ("a".to_string(), CallPhase::Finished)
            ]
        );
    }
}
