use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use services::services::{
    hub::{Connection, Hub, PING_PERIOD},
    message::{Envelope, MessageType, SubscriptionAction, SubscriptionData},
};

pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Hub>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// One reader and one writer task per socket; the hub only ever touches the
/// bounded channel between them, never the socket itself.
async fn handle_socket(socket: WebSocket, hub: Hub) {
    let (mut sink, mut stream) = socket.split();
    let (conn, mut rx) = Connection::channel();
    let conn_id = conn.id;
    hub.register(conn.clone()).await;

    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_PERIOD);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    let Ok(text) = serde_json::to_string(&envelope) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    let envelope = Envelope::new(MessageType::Ping, json!({}));
                    let Ok(text) = serde_json::to_string(&envelope) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
            tracing::debug!("Ignoring malformed frame from connection {conn_id}");
            continue;
        };
        match envelope.message_type {
            MessageType::Pong => conn.record_pong(),
            MessageType::Ping => {
                // Client-initiated liveness check; answer on the send channel
                // like any other message.
                conn.try_enqueue(Envelope::new(MessageType::Pong, json!({})));
            }
            MessageType::Subscription => {
                match serde_json::from_value::<SubscriptionData>(envelope.data) {
                    Ok(data) => match data.action {
                        SubscriptionAction::Subscribe => {
                            hub.subscribe(conn_id, data.project_id).await
                        }
                        SubscriptionAction::Unsubscribe => {
                            hub.unsubscribe(conn_id, data.project_id).await
                        }
                    },
                    Err(e) => {
                        tracing::debug!("Bad subscription frame from {conn_id}: {e}");
                    }
                }
            }
            other => tracing::debug!("Unhandled client frame {other:?} from {conn_id}"),
        }
    }

    hub.unregister(conn_id).await;
    writer.abort();
}
