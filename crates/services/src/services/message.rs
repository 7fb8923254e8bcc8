use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Pub/sub channel shared by all server and worker processes.
pub const BROKER_CHANNEL: &str = "websocket:broadcast";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    StatusChanged,
    ProjectUpdated,
    PrCreated,
    PrStatusChanged,
    PrUpdate,
    UserJoined,
    UserLeft,
    ExecutionLogsCreated,
    Ping,
    Pong,
    Subscription,
    AuthSuccess,
    AuthError,
    Error,
}

/// Wire envelope delivered to clients. Client-initiated frames may omit the
/// timestamp and message id; they are stamped on receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "Uuid::new_v4")]
    pub message_id: Uuid,
}

impl Envelope {
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Self {
            message_type,
            data,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4(),
        }
    }
}

/// Delivery target for a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastScope {
    Project(Uuid),
    User(Uuid),
    All,
}

/// Envelope carried over the cross-process broker; the scope travels with the
/// message so a receiving server can replay it into its own hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub message_id: Uuid,
    pub source: String,
}

impl BrokerMessage {
    pub fn new(scope: BroadcastScope, message_type: MessageType, data: Value, source: &str) -> Self {
        let (project_id, user_id) = match scope {
            BroadcastScope::Project(id) => (Some(id), None),
            BroadcastScope::User(id) => (None, Some(id)),
            BroadcastScope::All => (None, None),
        };
        Self {
            message_type,
            data,
            project_id,
            user_id,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4(),
            source: source.to_string(),
        }
    }

    pub fn scope(&self) -> BroadcastScope {
        match (self.project_id, self.user_id) {
            (Some(project_id), _) => BroadcastScope::Project(project_id),
            (None, Some(user_id)) => BroadcastScope::User(user_id),
            (None, None) => BroadcastScope::All,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            message_type: self.message_type,
            data: self.data.clone(),
            timestamp: self.timestamp,
            message_id: self.message_id,
        }
    }
}

/// Client-initiated subscription frame: `{type: "subscription", data: {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionData {
    pub action: SubscriptionAction,
    pub project_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// Payload of a `status_changed` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChangedData {
    pub entity_id: Uuid,
    pub entity_type: String,
    pub old_status: String,
    pub new_status: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope::new(MessageType::TaskUpdated, json!({"id": "x", "n": 3}));
        let serialized = serde_json::to_string(&envelope).unwrap();
        assert!(serialized.contains("\"type\":\"task_updated\""));
        let parsed: Envelope = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn broker_message_round_trips_and_keeps_scope() {
        let project_id = Uuid::new_v4();
        let msg = BrokerMessage::new(
            BroadcastScope::Project(project_id),
            MessageType::StatusChanged,
            json!({"old_status": "todo"}),
            "worker-1",
        );
        let parsed: BrokerMessage =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.scope(), BroadcastScope::Project(project_id));

        let all = BrokerMessage::new(BroadcastScope::All, MessageType::Ping, json!({}), "s");
        assert_eq!(all.scope(), BroadcastScope::All);
    }

    #[test]
    fn bare_client_subscription_frame_parses() {
        let frame: Envelope = serde_json::from_value(json!({
            "type": "subscription",
            "data": {"action": "subscribe", "project_id": Uuid::new_v4()},
        }))
        .unwrap();
        assert_eq!(frame.message_type, MessageType::Subscription);
        let data: SubscriptionData = serde_json::from_value(frame.data).unwrap();
        assert_eq!(data.action, SubscriptionAction::Subscribe);
    }
}
