//! Event Outbox - append-only log of committed operations
//!
//! Successful mutations append a strongly-typed event here as their last
//! commit step. External observers (dashboards, indexers) consume the log
//! asynchronously; the engine never reads it back. Events are immutable and
//! their ids are a strictly increasing sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::models::ServiceId;
use crate::EngineResult;

/// Event payloads observable by collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    ServiceCreated {
        service_id: ServiceId,
        client: String,
        contractor: String,
        amount: i64,
    },
    MilestoneCompleted {
        service_id: ServiceId,
        index: usize,
        amount: i64,
    },
    PaymentReleased {
        service_id: ServiceId,
        amount: i64,
        contractor: String,
    },
    ReviewSubmitted {
        service_id: ServiceId,
        reviewer: String,
        reviewee: String,
        rating: u8,
    },
    ContractorRegistered {
        contractor: String,
        name: String,
    },
}

impl EventKind {
    /// The service this event concerns, if any
    pub fn service_id(&self) -> Option<ServiceId> {
        match self {
            Self::ServiceCreated { service_id, .. }
            | Self::MilestoneCompleted { service_id, .. }
            | Self::PaymentReleased { service_id, .. }
            | Self::ReviewSubmitted { service_id, .. } => Some(*service_id),
            Self::ContractorRegistered { .. } => None,
        }
    }
}

/// One committed, immutable outbox entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: u64,
    pub kind: EventKind,
    pub recorded_at: DateTime<Utc>,
}

impl EngineEvent {
    /// Wire representation for indexer export
    pub fn to_json(&self) -> EngineResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Main event outbox
pub struct EventOutbox {
    /// In-memory event log (in production, this would be a durable table)
    events: RwLock<Vec<EngineEvent>>,
}

impl EventOutbox {
    /// Create an empty outbox
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }

    /// Append an event; ids start at 1 and increase by one per event
    pub async fn record(&self, kind: EventKind) -> EngineEvent {
        let mut events = self.events.write().await;
        let event = EngineEvent {
            id: events.len() as u64 + 1,
            kind,
            recorded_at: Utc::now(),
        };
        events.push(event.clone());
        event
    }

    /// All events with id greater than `after_id`, in order
    pub async fn events_since(&self, after_id: u64) -> Vec<EngineEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| event.id > after_id)
            .cloned()
            .collect()
    }

    /// All events concerning one service, in order
    pub async fn events_for_service(&self, service_id: ServiceId) -> Vec<EngineEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| event.kind.service_id() == Some(service_id))
            .cloned()
            .collect()
    }

    /// Number of events recorded
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

impl Default for EventOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let outbox = EventOutbox::new();

        for i in 0..3 {
            outbox
                .record(EventKind::MilestoneCompleted {
                    service_id: 1,
                    index: i,
                    amount: 100,
                })
                .await;
        }

        let events = outbox.events_since(0).await;
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let tail = outbox.events_since(2).await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, 3);
    }

    #[tokio::test]
    async fn filters_by_service() {
        let outbox = EventOutbox::new();
        outbox
            .record(EventKind::ServiceCreated {
                service_id: 1,
                client: "alice".to_string(),
                contractor: "bob".to_string(),
                amount: 300,
            })
            .await;
        outbox
            .record(EventKind::ContractorRegistered {
                contractor: "bob".to_string(),
                name: "Bob's Plumbing".to_string(),
            })
            .await;
        outbox
            .record(EventKind::PaymentReleased {
                service_id: 2,
                amount: 50,
                contractor: "bob".to_string(),
            })
            .await;

        assert_eq!(outbox.events_for_service(1).await.len(), 1);
        assert_eq!(outbox.events_for_service(2).await.len(), 1);
        assert_eq!(outbox.events_for_service(9).await.len(), 0);
    }

    #[tokio::test]
    async fn json_export_carries_payload() {
        let outbox = EventOutbox::new();
        let event = outbox
            .record(EventKind::PaymentReleased {
                service_id: 4,
                amount: 150,
                contractor: "bob".to_string(),
            })
            .await;

        let json = event.to_json().unwrap();
        assert_eq!(json["kind"]["type"], "PaymentReleased");
        assert_eq!(json["kind"]["service_id"], 4);
        assert_eq!(json["kind"]["amount"], 150);
    }
}
