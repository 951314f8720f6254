//! Kubernetes events describing what the reconcilers did to an object

use std::{
    fmt::{self, Display},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::api::core::v1::ObjectReference,
    kube::runtime::events::{self, Recorder, Reporter},
};

use crate::OPERATOR_NAME;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl Display for ReconcileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.event_type, self.reason, self.message)
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishing is best-effort, failures are logged and otherwise ignored.
    async fn publish(&self, regarding: &ObjectReference, event: ReconcileEvent);
}

/// Publishes events through the Kubernetes events API.
#[derive(Clone)]
pub struct KubeEventSink {
    client: stackable_operator::kube::Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: &stackable_operator::client::Client, controller_name: &str) -> Self {
        Self {
            client: client.as_kube_client(),
            reporter: Reporter {
                controller: format!("{controller_name}.{OPERATOR_NAME}"),
                instance: None,
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, regarding: &ObjectReference, event: ReconcileEvent) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            regarding.clone(),
        );
        let result = recorder
            .publish(events::Event {
                type_: match event.event_type {
                    EventType::Normal => events::EventType::Normal,
                    EventType::Warning => events::EventType::Warning,
                },
                reason: event.reason.clone(),
                note: Some(event.message.clone()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                object.kind = ?regarding.kind,
                object.name = ?regarding.name,
                object.namespace = ?regarding.namespace,
                %event,
                "failed to publish event"
            );
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub regarding: ObjectReference,
    pub event: ReconcileEvent,
}

/// An [`EventSink`] that keeps all events in memory.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<RecordedEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All events so far, formatted as `"{type} {reason} {message}"`.
    pub fn messages(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|recorded| recorded.event.to_string())
            .collect()
    }
}

#[async_trait]
impl EventSink for EventLog {
    async fn publish(&self, regarding: &ObjectReference, event: ReconcileEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                regarding: regarding.clone(),
                event,
            });
    }
}
