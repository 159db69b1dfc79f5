//! Controller implementations for the Freight CRDs
//!
//! Four controllers share one engine: each loads its resource, consults the
//! condition ledger for what is already done, drives the next unconverged
//! stage, and returns either "done" or a timed requeue. Errors abort the
//! pass and are retried by the controller runtime with backoff.

pub mod bundle;
pub mod gateway;
pub mod instance;
pub mod plugin;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::FIELD_MANAGER;

/// Severity of a published event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    /// Routine progress
    Normal,
    /// Something is delaying convergence
    Warning,
}

/// Publishes events on managed objects
///
/// Events are best-effort observability; publishing failures are logged and
/// never affect control flow.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event against the referenced object
    async fn publish(
        &self,
        reference: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        note: &str,
    );
}

/// Event publisher backed by the Kubernetes events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as the Freight controller
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        reference: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        note: &str,
    ) {
        let event = Event {
            type_: match severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(error = %e, reason = reason, "failed to publish event");
        }
    }
}
