//! Workflow lifecycle events and the bus that carries them

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BusError;
use crate::types::{PlanId, StepId};

/// How many recent keys a subscription remembers for deduplication
pub const DEFAULT_DEDUP_WINDOW: usize = 4096;

type DedupKey = (PlanId, Option<StepId>, String);

/// Event kinds published by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "plan.started")]
    PlanStarted,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.skipped")]
    StepSkipped,
    #[serde(rename = "plan.completed")]
    PlanCompleted,
}

impl EventKind {
    pub fn topic(self) -> &'static str {
        match self {
            Self::PlanStarted => "plan.started",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::StepSkipped => "step.skipped",
            Self::PlanCompleted => "plan.completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// Payload of every lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: Uuid,
    pub kind: EventKind,
    pub plan_id: PlanId,
    pub step_id: Option<StepId>,
    /// Step status or plan outcome, as text
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn plan(kind: EventKind, plan_id: PlanId, status: impl fmt::Display) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            plan_id,
            step_id: None,
            status: status.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn step(
        kind: EventKind,
        plan_id: PlanId,
        step_id: StepId,
        status: impl fmt::Display,
    ) -> Self {
        Self {
            step_id: Some(step_id),
            ..Self::plan(kind, plan_id, status)
        }
    }

    /// Key subscribers deduplicate on
    pub fn dedup_key(&self) -> DedupKey {
        (self.plan_id, self.step_id.clone(), self.status.clone())
    }
}

/// Append-only, at-least-once event channel
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: WorkflowEvent) -> Result<(), BusError>;
}

/// In-process bus fanning events out to every subscriber
#[derive(Debug, Default)]
pub struct ChannelEventBus {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<WorkflowEvent>>>,
    closed: AtomicBool,
}

impl ChannelEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_with_window(DEFAULT_DEDUP_WINDOW)
    }

    /// Like `subscribe`, remembering the last `window` keys for deduplication
    pub fn subscribe_with_window(&self, window: usize) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            self.subscribers.write().push(tx);
        }
        EventSubscription {
            rx,
            seen: HashSet::new(),
            recent: VecDeque::new(),
            window: window.max(1),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Stop accepting events; open subscriptions end once drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn publish(&self, event: WorkflowEvent) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }
}

/// Subscriber side of a `ChannelEventBus`.
///
/// Redeliveries with the same `(plan_id, step_id, status)` are dropped, as
/// long as the original is among the last `window` distinct keys seen.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<WorkflowEvent>,
    seen: HashSet<DedupKey>,
    recent: VecDeque<DedupKey>,
    window: usize,
}

impl EventSubscription {
    /// Next unseen event, waiting if none is queued
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        while let Some(event) = self.rx.recv().await {
            if self.remember(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Next unseen event if one is already queued
    pub fn try_recv(&mut self) -> Option<WorkflowEvent> {
        while let Ok(event) = self.rx.try_recv() {
            if self.remember(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Everything queued right now
    pub fn drain(&mut self) -> Vec<WorkflowEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Record the event's key; false if it was already seen
    fn remember(&mut self, event: &WorkflowEvent) -> bool {
        let key = event.dedup_key();
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.recent.push_back(key);
        while self.recent.len() > self.window {
            if let Some(oldest) = self.recent.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepStatus;

    #[tokio::test]
    async fn test_fan_out() {
        let bus = ChannelEventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let plan_id = PlanId::new();
        bus.publish(WorkflowEvent::plan(EventKind::PlanStarted, plan_id, "running"))
            .await
            .unwrap();

        assert_eq!(first.recv().await.unwrap().kind, EventKind::PlanStarted);
        assert_eq!(second.try_recv().unwrap().plan_id, plan_id);
    }

    #[tokio::test]
    async fn test_duplicates_dropped() {
        let bus = ChannelEventBus::new();
        let mut sub = bus.subscribe();
        let plan_id = PlanId::new();

        let event = WorkflowEvent::step(
            EventKind::StepCompleted,
            plan_id,
            "a".into(),
            StepStatus::Succeeded,
        );
        bus.publish(event.clone()).await.unwrap();
        bus.publish(WorkflowEvent { event_id: Uuid::new_v4(), ..event }).await.unwrap();
        bus.publish(WorkflowEvent::step(
            EventKind::StepCompleted,
            plan_id,
            "b".into(),
            StepStatus::Succeeded,
        ))
        .await
        .unwrap();

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].step_id, Some(StepId::from("b")));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let bus = ChannelEventBus::new();
        let sub = bus.subscribe();
        drop(sub);

        bus.publish(WorkflowEvent::plan(EventKind::PlanCompleted, PlanId::new(), "completed"))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dedup_window_is_bounded() {
        let bus = ChannelEventBus::new();
        let mut sub = bus.subscribe_with_window(2);
        let plan_id = PlanId::new();
        let completed = |step: &str| {
            WorkflowEvent::step(
                EventKind::StepCompleted,
                plan_id,
                step.into(),
                StepStatus::Succeeded,
            )
        };

        for step in ["a", "b", "c"] {
            bus.publish(completed(step)).await.unwrap();
        }
        assert_eq!(sub.drain().len(), 3);
        assert_eq!(sub.seen.len(), 2);

        // "c" is still remembered, "a" has aged out.
        bus.publish(completed("c")).await.unwrap();
        bus.publish(completed("a")).await.unwrap();
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].step_id, Some(StepId::from("a")));
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_publish() {
        let bus = ChannelEventBus::new();
        let mut sub = bus.subscribe();
        bus.close();

        let err = bus
            .publish(WorkflowEvent::plan(EventKind::PlanStarted, PlanId::new(), "running"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Closed));
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_topic_serialization() {
        let json = serde_json::to_string(&EventKind::StepFailed).unwrap();
        assert_eq!(json, "\"step.failed\"");
        assert_eq!(EventKind::PlanCompleted.to_string(), "plan.completed");
    }
}
