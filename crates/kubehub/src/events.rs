//! Audit events attached to reconciled objects.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails
//! the reconcile pass that produced it.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use steward_core::EventKind;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerEvent {
    pub object: ObjectReference,
    pub kind: EventKind,
    /// Machine-readable reason, e.g. `ErrResourceExists`.
    pub reason: String,
    pub message: String,
}

impl ControllerEvent {
    pub fn normal(object: ObjectReference, reason: &str, message: impl Into<String>) -> Self {
        Self { object, kind: EventKind::Normal, reason: reason.to_string(), message: message.into() }
    }

    pub fn warning(object: ObjectReference, reason: &str, message: impl Into<String>) -> Self {
        Self { object, kind: EventKind::Warning, reason: reason.to_string(), message: message.into() }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: ControllerEvent);
}

/// Records events through the API server (`kubectl describe` shows them).
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter { controller: controller_name.to_string(), instance: None };
        Self { recorder: Recorder::new(client, reporter) }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, event: ControllerEvent) {
        let ev = Event {
            type_: match event.kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, &event.object).await {
            warn!(reason = %event.reason, error = %e, "failed to publish event");
        }
    }
}

/// Keeps events in memory; used by tests and dry runs.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<ControllerEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<ControllerEvent> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<ControllerEvent> {
        self.events().into_iter().filter(|e| e.reason == reason).collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: ControllerEvent) {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(event);
    }
}
