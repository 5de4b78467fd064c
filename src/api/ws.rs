//! WebSocket observers. Each connection gets a reader task that applies
//! control messages and a writer task that drains hub updates.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::server::AppState;
use crate::config::HubSettings;
use crate::hub::{ClientId, HubClient, HubHandle};

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeQuery {
    pub deployment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ControlMessage {
    Subscribe { deployment_id: String },
    Unsubscribe,
}

pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_session(socket, state.hub, state.hub_settings, query.deployment_id)
    })
}

async fn handle_session(
    socket: WebSocket,
    hub: HubHandle,
    settings: HubSettings,
    deployment_id: Option<String>,
) {
    let client = match hub.register(deployment_id).await {
        Ok(client) => client,
        Err(e) => {
            warn!("Rejecting WebSocket observer: {}", e);
            return;
        }
    };
    let id = client.id;
    info!(client = id, "WebSocket observer connected");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_updates(sink, client, settings.clone()));
    let mut reader = tokio::spawn(read_controls(stream, hub.clone(), id, settings));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    if let Err(e) = hub.unregister(id).await {
        debug!(client = id, "Unregister after disconnect failed: {}", e);
    }
    info!(client = id, "WebSocket observer disconnected");
}

async fn read_controls(
    mut stream: SplitStream<WebSocket>,
    hub: HubHandle,
    id: ClientId,
    settings: HubSettings,
) {
    loop {
        let message = match timeout(settings.read_deadline, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(client = id, "WebSocket read failed: {}", e);
                return;
            }
            Ok(None) => return,
            Err(_) => {
                debug!(client = id, "WebSocket read deadline passed");
                return;
            }
        };

        match message {
            Message::Text(text) => {
                let applied = match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(ControlMessage::Subscribe { deployment_id }) => {
                        hub.subscribe(id, deployment_id).await
                    }
                    Ok(ControlMessage::Unsubscribe) => hub.unsubscribe(id).await,
                    Err(e) => {
                        debug!(client = id, "Ignoring malformed control message: {}", e);
                        Ok(())
                    }
                };
                if applied.is_err() {
                    return;
                }
            }
            Message::Close(_) => return,
            // Pongs and other frames only extend the read deadline.
            _ => {}
        }
    }
}

async fn write_updates(
    mut sink: SplitSink<WebSocket, Message>,
    mut client: HubClient,
    settings: HubSettings,
) {
    let mut ping = interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            update = client.updates.recv() => match update {
                Some(update) => match serde_json::to_string(&update) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        warn!(client = client.id, "Failed to encode update: {}", e);
                        continue;
                    }
                },
                None => {
                    let _ = timeout(settings.write_deadline, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(settings.write_deadline, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client = client.id, "WebSocket write failed: {}", e);
                return;
            }
            Err(_) => {
                debug!(client = client.id, "WebSocket write deadline passed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_messages_parse() {
        let subscribe: ControlMessage =
            serde_json::from_str(r#"{"action":"subscribe","deployment_id":"abc"}"#).unwrap();
        assert!(matches!(
            subscribe,
            ControlMessage::Subscribe { deployment_id } if deployment_id == "abc"
        ));

        let unsubscribe: ControlMessage =
            serde_json::from_str(r#"{"action":"unsubscribe"}"#).unwrap();
        assert!(matches!(unsubscribe, ControlMessage::Unsubscribe));

        assert!(serde_json::from_str::<ControlMessage>(r#"{"action":"shout"}"#).is_err());
    }
}
