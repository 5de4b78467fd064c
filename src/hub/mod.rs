//! Status hub: a single task owns the client and subscription maps and
//! fans out updates to connected observers.

pub mod streamer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HubSettings;
use crate::error::{DeployError, Result};
use crate::models::StatusUpdate;

pub use streamer::StatusStreamer;

pub type ClientId = u64;

struct Registration {
    id: ClientId,
    deployment_id: Option<String>,
    sender: mpsc::Sender<StatusUpdate>,
}

enum SubscriptionChange {
    Subscribe {
        client: ClientId,
        deployment_id: String,
    },
    Unsubscribe {
        client: ClientId,
    },
}

struct ConnectedClient {
    sender: mpsc::Sender<StatusUpdate>,
    deployment_id: Option<String>,
}

/// Receiving side of a registered observer.
pub struct HubClient {
    pub id: ClientId,
    pub updates: mpsc::Receiver<StatusUpdate>,
}

/// Cloneable front door to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ClientId>,
    subscription_tx: mpsc::Sender<SubscriptionChange>,
    broadcast_tx: mpsc::Sender<StatusUpdate>,
    next_id: Arc<AtomicU64>,
    client_buffer: usize,
}

fn hub_closed() -> DeployError {
    DeployError::Transient("status hub is not running".to_string())
}

impl HubHandle {
    /// Adds a client, optionally already subscribed to one deployment.
    pub async fn register(&self, deployment_id: Option<String>) -> Result<HubClient> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, updates) = mpsc::channel(self.client_buffer);
        self.register_tx
            .send(Registration {
                id,
                deployment_id,
                sender,
            })
            .await
            .map_err(|_| hub_closed())?;
        Ok(HubClient { id, updates })
    }

    pub async fn unregister(&self, client: ClientId) -> Result<()> {
        self.unregister_tx
            .send(client)
            .await
            .map_err(|_| hub_closed())
    }

    pub async fn subscribe(&self, client: ClientId, deployment_id: String) -> Result<()> {
        self.subscription_tx
            .send(SubscriptionChange::Subscribe {
                client,
                deployment_id,
            })
            .await
            .map_err(|_| hub_closed())
    }

    pub async fn unsubscribe(&self, client: ClientId) -> Result<()> {
        self.subscription_tx
            .send(SubscriptionChange::Unsubscribe { client })
            .await
            .map_err(|_| hub_closed())
    }

    pub async fn broadcast(&self, update: StatusUpdate) -> Result<()> {
        self.broadcast_tx
            .send(update)
            .await
            .map_err(|_| hub_closed())
    }
}

pub struct StatusHub {
    clients: HashMap<ClientId, ConnectedClient>,
    subscribers: HashMap<String, Vec<ClientId>>,
    settings: HubSettings,
}

impl StatusHub {
    /// Starts the hub task. It runs until every handle has been dropped.
    pub fn spawn(settings: HubSettings) -> HubHandle {
        let (register_tx, register_rx) = mpsc::channel(settings.channel_buffer);
        let (unregister_tx, unregister_rx) = mpsc::channel(settings.channel_buffer);
        let (subscription_tx, subscription_rx) = mpsc::channel(settings.channel_buffer);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(settings.channel_buffer);

        let handle = HubHandle {
            register_tx,
            unregister_tx,
            subscription_tx,
            broadcast_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            client_buffer: settings.client_buffer.max(1),
        };

        let hub = StatusHub {
            clients: HashMap::new(),
            subscribers: HashMap::new(),
            settings,
        };
        tokio::spawn(hub.run(register_rx, unregister_rx, subscription_rx, broadcast_rx));

        handle
    }

    async fn run(
        mut self,
        mut register_rx: mpsc::Receiver<Registration>,
        mut unregister_rx: mpsc::Receiver<ClientId>,
        mut subscription_rx: mpsc::Receiver<SubscriptionChange>,
        mut broadcast_rx: mpsc::Receiver<StatusUpdate>,
    ) {
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Status hub started");
        loop {
            tokio::select! {
                registration = register_rx.recv() => match registration {
                    Some(registration) => self.register(registration),
                    None => break,
                },
                Some(client) = unregister_rx.recv() => self.unregister(client),
                Some(change) = subscription_rx.recv() => match change {
                    SubscriptionChange::Subscribe { client, deployment_id } => {
                        self.subscribe(client, deployment_id)
                    }
                    SubscriptionChange::Unsubscribe { client } => self.unsubscribe(client),
                },
                Some(update) = broadcast_rx.recv() => self.deliver(update),
                _ = heartbeat.tick() => self.deliver(StatusUpdate::heartbeat()),
            }
        }
        info!("Status hub stopped");
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            id,
            deployment_id,
            sender,
        } = registration;

        if let Some(deployment_id) = &deployment_id {
            self.subscribers
                .entry(deployment_id.clone())
                .or_default()
                .push(id);
        }
        let client = ConnectedClient {
            sender,
            deployment_id: deployment_id.clone(),
        };
        Self::send_to(id, &client, StatusUpdate::connected(deployment_id));
        self.clients.insert(id, client);
        debug!(client = id, "Client registered");
    }

    fn unregister(&mut self, id: ClientId) {
        self.detach(id);
        // Dropping the entry drops the sender, which closes the client's stream.
        if self.clients.remove(&id).is_some() {
            debug!(client = id, "Client unregistered");
        }
    }

    fn subscribe(&mut self, id: ClientId, deployment_id: String) {
        if !self.clients.contains_key(&id) {
            return;
        }
        self.detach(id);
        self.subscribers
            .entry(deployment_id.clone())
            .or_default()
            .push(id);
        if let Some(client) = self.clients.get_mut(&id) {
            client.deployment_id = Some(deployment_id);
        }
    }

    fn unsubscribe(&mut self, id: ClientId) {
        self.detach(id);
        if let Some(client) = self.clients.get_mut(&id) {
            client.deployment_id = None;
        }
    }

    /// Removes a client from whatever subscriber list it is on.
    fn detach(&mut self, id: ClientId) {
        let Some(deployment_id) = self
            .clients
            .get(&id)
            .and_then(|client| client.deployment_id.clone())
        else {
            return;
        };
        if let Some(list) = self.subscribers.get_mut(&deployment_id) {
            list.retain(|client| *client != id);
            if list.is_empty() {
                self.subscribers.remove(&deployment_id);
            }
        }
    }

    fn deliver(&mut self, update: StatusUpdate) {
        match &update.deployment_id {
            Some(deployment_id) => {
                let Some(ids) = self.subscribers.get(deployment_id) else {
                    return;
                };
                for id in ids {
                    if let Some(client) = self.clients.get(id) {
                        Self::send_to(*id, client, update.clone());
                    }
                }
            }
            None => {
                for (id, client) in &self.clients {
                    Self::send_to(*id, client, update.clone());
                }
            }
        }
    }

    fn send_to(id: ClientId, client: &ConnectedClient, update: StatusUpdate) {
        match client.sender.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(client = id, "Client buffer full, dropping update");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client = id, "Client channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UpdateType;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn settings() -> HubSettings {
        HubSettings {
            heartbeat_interval: Duration::from_secs(3600),
            client_buffer: 4,
            ..HubSettings::default()
        }
    }

    async fn next(client: &mut HubClient) -> StatusUpdate {
        timeout(Duration::from_secs(2), client.updates.recv())
            .await
            .expect("timed out waiting for update")
            .expect("client channel closed")
    }

    async fn assert_silent(client: &mut HubClient) {
        assert!(timeout(Duration::from_millis(100), client.updates.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_register_sends_connection_update() {
        let hub = StatusHub::spawn(settings());
        let mut client = hub.register(Some("d-1".to_string())).await.unwrap();

        let update = next(&mut client).await;
        assert_eq!(update.update_type, UpdateType::Connection);
        assert_eq!(update.deployment_id.as_deref(), Some("d-1"));
    }

    #[tokio::test]
    async fn test_targeted_and_global_delivery() {
        let hub = StatusHub::spawn(settings());
        let mut watcher = hub.register(Some("d-1".to_string())).await.unwrap();
        let mut other = hub.register(Some("d-2".to_string())).await.unwrap();
        let mut idle = hub.register(None).await.unwrap();
        next(&mut watcher).await;
        next(&mut other).await;
        next(&mut idle).await;

        hub.broadcast(StatusUpdate::for_deployment(
            "d-1",
            UpdateType::Status,
            json!({"status": "deploying"}),
        ))
        .await
        .unwrap();
        assert_eq!(next(&mut watcher).await.data["status"], "deploying");
        assert_silent(&mut other).await;
        assert_silent(&mut idle).await;

        hub.broadcast(StatusUpdate::new(None, UpdateType::Log, json!({"message": "hi"})))
            .await
            .unwrap();
        for client in [&mut watcher, &mut other, &mut idle] {
            assert_eq!(next(client).await.update_type, UpdateType::Log);
        }
    }

    #[tokio::test]
    async fn test_unregister_closes_client_stream() {
        let hub = StatusHub::spawn(settings());
        let mut client = hub.register(None).await.unwrap();
        next(&mut client).await;

        hub.unregister(client.id).await.unwrap();
        let closed = timeout(Duration::from_secs(2), client.updates.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_full_client_buffer_drops_updates() {
        let hub = StatusHub::spawn(settings());
        let mut slow = hub.register(Some("d-1".to_string())).await.unwrap();
        let mut fast = hub.register(Some("d-1".to_string())).await.unwrap();
        next(&mut fast).await;

        for i in 0..10 {
            hub.broadcast(StatusUpdate::for_deployment("d-1", UpdateType::Log, json!({"i": i})))
                .await
                .unwrap();
            next(&mut fast).await;
        }

        // Connection update plus three logs fill the buffer of four.
        let mut received = 0;
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), slow.updates.recv()).await {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn test_heartbeat_reaches_every_client() {
        let hub = StatusHub::spawn(HubSettings {
            heartbeat_interval: Duration::from_millis(50),
            ..settings()
        });
        let mut client = hub.register(Some("d-1".to_string())).await.unwrap();
        next(&mut client).await;

        let update = next(&mut client).await;
        assert_eq!(update.update_type, UpdateType::Ping);
        assert!(update.deployment_id.is_none());
    }

    #[tokio::test]
    async fn test_resubscribe_moves_client() {
        let hub = StatusHub::spawn(settings());
        let mut client = hub.register(Some("d-1".to_string())).await.unwrap();
        next(&mut client).await;

        hub.subscribe(client.id, "d-2".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.broadcast(StatusUpdate::for_deployment("d-1", UpdateType::Log, json!({})))
            .await
            .unwrap();
        hub.broadcast(StatusUpdate::for_deployment("d-2", UpdateType::Status, json!({})))
            .await
            .unwrap();
        assert_eq!(next(&mut client).await.deployment_id.as_deref(), Some("d-2"));
    }
}
