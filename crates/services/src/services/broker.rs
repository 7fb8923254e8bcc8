use std::time::Duration;

use futures::StreamExt;
use redis::AsyncCommands;
use thiserror::Error;

use super::{
    hub::Hub,
    message::{BROKER_CHANNEL, BroadcastScope, BrokerMessage},
};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Cross-process pub/sub bridge. Workers publish events here; every server
/// instance subscribes and replays them into its local hub. Delivery is
/// best-effort with no persistence, so clients reconcile by re-reading state.
#[derive(Clone)]
pub struct Broker {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl Broker {
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }

    pub async fn publish(&self, msg: &BrokerMessage) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(msg)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(BROKER_CHANNEL, payload).await?;
        Ok(())
    }

    /// Subscribe to the broadcast channel and forward every decoded message
    /// into `hub`. Reconnects with a delay on any subscription error.
    pub fn spawn_subscriber(&self, hub: Hub) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(BROKER_CHANNEL).await {
                            tracing::warn!("Broker subscribe failed, retrying: {e}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            continue;
                        }
                        tracing::info!("Subscribed to broker channel {BROKER_CHANNEL}");
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let payload: String = match msg.get_payload() {
                                Ok(payload) => payload,
                                Err(e) => {
                                    tracing::warn!("Broker payload read failed: {e}");
                                    continue;
                                }
                            };
                            match serde_json::from_str::<BrokerMessage>(&payload) {
                                Ok(message) => dispatch_to_hub(&hub, message).await,
                                Err(e) => {
                                    tracing::warn!("Dropping undecodable broker message: {e}")
                                }
                            }
                        }
                        tracing::warn!("Broker subscription closed, reconnecting");
                    }
                    Err(e) => {
                        tracing::warn!("Broker connection failed, retrying: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        })
    }
}

/// Replay one broker message into a local hub using its target scope.
pub async fn dispatch_to_hub(hub: &Hub, message: BrokerMessage) {
    let envelope = message.to_envelope();
    match message.scope() {
        BroadcastScope::Project(project_id) => {
            hub.broadcast_to_project(envelope, project_id, None).await
        }
        BroadcastScope::User(user_id) => hub.broadcast_to_user(envelope, user_id, None).await,
        BroadcastScope::All => hub.broadcast_to_all(envelope, None).await,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::services::{
        hub::Connection,
        message::MessageType,
    };

    /// The broker law without a live bus: a published message replayed into
    /// two independent hubs reaches exactly the connections in scope.
    #[tokio::test]
    async fn replay_fans_out_per_hub_by_scope() {
        let project = Uuid::new_v4();
        let other_project = Uuid::new_v4();
        let message = BrokerMessage::new(
            BroadcastScope::Project(project),
            MessageType::TaskUpdated,
            json!({"title": "t"}),
            "worker-1",
        );

        for _server in 0..2 {
            let hub = Hub::new();
            let (subscribed, mut rx_subscribed) = Connection::channel();
            let (elsewhere, mut rx_elsewhere) = Connection::channel();
            hub.register(subscribed.clone()).await;
            hub.register(elsewhere.clone()).await;
            hub.subscribe(subscribed.id, project).await;
            hub.subscribe(elsewhere.id, other_project).await;

            dispatch_to_hub(&hub, message.clone()).await;

            let delivered = rx_subscribed.try_recv().unwrap();
            assert_eq!(delivered.message_id, message.message_id);
            assert_eq!(delivered.message_type, MessageType::TaskUpdated);
            assert!(rx_elsewhere.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn all_scope_reaches_every_connection() {
        let hub = Hub::new();
        let (a, mut rx_a) = Connection::channel();
        let (b, mut rx_b) = Connection::channel();
        hub.register(a).await;
        hub.register(b).await;

        let message =
            BrokerMessage::new(BroadcastScope::All, MessageType::ProjectUpdated, json!({}), "s");
        dispatch_to_hub(&hub, message).await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
