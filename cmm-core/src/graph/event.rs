//! Graph status events
//!
//! Events travel downstream along socket → plug edges, separately from the
//! data pulled upstream. Every delivered event is recorded in a bounded log
//! and handed to the registered observers.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::NodeId;

/// Status change signalled over a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorEvent {
    Ok,
    /// A plug was bound to the socket
    Connected,
    /// A plug was unbound from the socket
    Released,
    DataChanged,
    StorageChanged,
    /// Connector shapes do not fit
    IncompatibleData,
    /// An option change could not be applied
    IncompatibleOption,
    /// The node's context has the wrong resource kind
    IncompatibleContext,
    /// A mandatory plug is unbound
    IncompleteGraph,
    /// Upstream options changed; cached state downstream is stale
    ContextInvalidated,
}

impl ConnectorEvent {
    /// Whether receiving this event makes a node's last output stale
    pub fn invalidates_data(&self) -> bool {
        matches!(
            self,
            ConnectorEvent::DataChanged
                | ConnectorEvent::StorageChanged
                | ConnectorEvent::ContextInvalidated
                | ConnectorEvent::Released
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorEvent::Ok => "ok",
            ConnectorEvent::Connected => "connected",
            ConnectorEvent::Released => "released",
            ConnectorEvent::DataChanged => "data_changed",
            ConnectorEvent::StorageChanged => "storage_changed",
            ConnectorEvent::IncompatibleData => "incompatible_data",
            ConnectorEvent::IncompatibleOption => "incompatible_option",
            ConnectorEvent::IncompatibleContext => "incompatible_context",
            ConnectorEvent::IncompleteGraph => "incomplete_graph",
            ConnectorEvent::ContextInvalidated => "context_invalidated",
        }
    }
}

impl fmt::Display for ConnectorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery of a [`ConnectorEvent`] to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEvent {
    pub event: ConnectorEvent,
    /// Node that raised the event
    pub origin: NodeId,
    /// Socket of `origin` the event left through, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<usize>,
    /// Node receiving the event
    pub target: NodeId,
    /// Ticket being pulled when the event was raised
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl GraphEvent {
    pub fn new(event: ConnectorEvent, origin: NodeId, target: NodeId) -> Self {
        Self {
            event,
            origin,
            socket: None,
            target,
            ticket_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_socket(mut self, socket: Option<usize>) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_ticket(mut self, ticket_id: Option<Uuid>) -> Self {
        self.ticket_id = ticket_id;
        self
    }
}

/// Receives graph events as they are delivered
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &GraphEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&GraphEvent) + Send + Sync,
{
    fn on_event(&self, event: &GraphEvent) {
        self(event)
    }
}

/// Bounded record of delivered events, oldest dropped first
#[derive(Debug, Clone)]
pub(crate) struct EventLog {
    events: VecDeque<GraphEvent>,
    capacity: usize,
}

impl EventLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, event: GraphEvent) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &GraphEvent> {
        self.events.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_bounded() {
        let a = NodeId::new(0, 0);
        let b = NodeId::new(1, 0);
        let mut log = EventLog::new(2);
        log.push(GraphEvent::new(ConnectorEvent::Connected, a, b));
        log.push(GraphEvent::new(ConnectorEvent::DataChanged, a, b));
        log.push(GraphEvent::new(ConnectorEvent::Released, a, b));

        let kinds: Vec<_> = log.iter().map(|e| e.event).collect();
        assert_eq!(kinds, vec![ConnectorEvent::DataChanged, ConnectorEvent::Released]);
    }

    #[test]
    fn test_event_serializes_snake_case() {
        let event = GraphEvent::new(ConnectorEvent::ContextInvalidated, NodeId::new(0, 0), NodeId::new(2, 1))
            .with_socket(Some(0));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "context_invalidated");
        assert_eq!(json["socket"], 0);
        assert!(json.get("ticket_id").is_none());
    }

    #[test]
    fn test_invalidating_events() {
        assert!(ConnectorEvent::ContextInvalidated.invalidates_data());
        assert!(!ConnectorEvent::Connected.invalidates_data());
        assert!(!ConnectorEvent::IncompleteGraph.invalidates_data());
    }
}
