//! In-process network registry

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::{Network, NetworkManager};

const EVENT_CAPACITY: usize = 1024;

/// Change applied to the registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    Ensured(Network),
    Deleted(String),
}

/// NetworkRegistry keeps the networks ensured by the NAD controller and
/// publishes every change to its subscribers
#[derive(Clone)]
pub struct NetworkRegistry {
    // Map of network name to network
    networks: Arc<RwLock<HashMap<String, Network>>>,
    events: broadcast::Sender<NetworkEvent>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            networks: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Receive every ensure and delete applied from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// List all networks
    pub async fn list_networks(&self) -> Vec<Network> {
        let networks = self.networks.read().await;
        let mut list: Vec<Network> = networks.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    /// Get count of registered networks
    pub async fn network_count(&self) -> usize {
        self.networks.read().await.len()
    }

    fn publish(&self, event: NetworkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkManager for NetworkRegistry {
    async fn ensure_network(&self, network: Network) {
        let name = network.name().to_string();
        self.networks.write().await.insert(name.clone(), network.clone());
        debug!(network = %name, nads = ?network.nads(), "Ensured network");
        self.publish(NetworkEvent::Ensured(network));
    }

    async fn delete_network(&self, name: &str) {
        let removed = self.networks.write().await.remove(name).is_some();
        debug!(network = %name, removed, "Deleted network");
        self.publish(NetworkEvent::Deleted(name.to_string()));
    }

    async fn get_network(&self, name: &str) -> Option<Network> {
        if name.is_empty() {
            return None;
        }
        self.networks.read().await.get(name).cloned()
    }
}
