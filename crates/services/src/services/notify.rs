use std::sync::Arc;

use db::models::{
    pull_request::{PrStatus, PullRequest},
    task::{Task, TaskStatus},
};
use serde_json::{Value, json};
use uuid::Uuid;

use super::{
    broker::Broker,
    hub::Hub,
    message::{BroadcastScope, BrokerMessage, Envelope, MessageType, StatusChangedData},
};

/// Single call site for emitting task/status/PR events.
///
/// When a broker is configured, events go through it so clients on other
/// server processes see them too; on publish failure (or with no broker) the
/// event falls back to the local hub.
#[derive(Clone)]
pub struct NotificationService {
    hub: Hub,
    broker: Option<Arc<Broker>>,
    source: String,
}

impl NotificationService {
    pub fn new(hub: Hub, broker: Option<Arc<Broker>>, source: &str) -> Self {
        Self {
            hub,
            broker,
            source: source.to_string(),
        }
    }

    async fn publish(&self, scope: BroadcastScope, message_type: MessageType, data: Value) {
        if let Some(broker) = &self.broker {
            let msg = BrokerMessage::new(scope, message_type, data.clone(), &self.source);
            match broker.publish(&msg).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!("Broker publish failed, falling back to local hub: {e}");
                }
            }
        }
        let envelope = Envelope::new(message_type, data);
        match scope {
            BroadcastScope::Project(project_id) => {
                self.hub
                    .broadcast_to_project(envelope, project_id, None)
                    .await
            }
            BroadcastScope::User(user_id) => {
                self.hub.broadcast_to_user(envelope, user_id, None).await
            }
            BroadcastScope::All => self.hub.broadcast_to_all(envelope, None).await,
        }
    }

    /// Every status transition produces two messages: a `task_updated` with
    /// the changed fields and a `status_changed` with the old/new pair.
    pub async fn task_status_changed(&self, task: &Task, old: TaskStatus, new: TaskStatus) {
        self.publish(
            BroadcastScope::Project(task.project_id),
            MessageType::TaskUpdated,
            json!({
                "task": task,
                "changes": {"status": {"from": old, "to": new}},
            }),
        )
        .await;
        let data = StatusChangedData {
            entity_id: task.id,
            entity_type: "task".to_string(),
            old_status: old.to_string(),
            new_status: new.to_string(),
        };
        self.publish(
            BroadcastScope::Project(task.project_id),
            MessageType::StatusChanged,
            serde_json::to_value(data).unwrap_or_default(),
        )
        .await;
    }

    pub async fn task_updated(&self, task: &Task, changes: Value) {
        self.publish(
            BroadcastScope::Project(task.project_id),
            MessageType::TaskUpdated,
            json!({"task": task, "changes": changes}),
        )
        .await;
    }

    pub async fn pr_created(&self, project_id: Uuid, pr: &PullRequest) {
        self.publish(
            BroadcastScope::Project(project_id),
            MessageType::PrCreated,
            json!({"pull_request": pr}),
        )
        .await;
    }

    pub async fn pr_status_changed(
        &self,
        project_id: Uuid,
        pr: &PullRequest,
        old: PrStatus,
        new: PrStatus,
    ) {
        self.publish(
            BroadcastScope::Project(project_id),
            MessageType::PrStatusChanged,
            json!({
                "pull_request": pr,
                "old_status": old,
                "new_status": new,
            }),
        )
        .await;
    }

    pub async fn execution_logs_created(
        &self,
        project_id: Uuid,
        execution_id: Uuid,
        line_count: usize,
    ) {
        self.publish(
            BroadcastScope::Project(project_id),
            MessageType::ExecutionLogsCreated,
            json!({"execution_id": execution_id, "line_count": line_count}),
        )
        .await;
    }
}
