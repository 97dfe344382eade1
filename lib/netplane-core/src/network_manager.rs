//! Interface to the component that runs per-network controllers

use async_trait::async_trait;

use crate::Network;

/// Owner of the per-network controllers. Calls are idempotent: ensuring an
/// unchanged network or deleting a missing one is a no-op.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Start or update the controller of `network`, which carries the full
    /// set of attachment definitions that reference it
    async fn ensure_network(&self, network: Network);

    /// Stop the controller of the network called `name`
    async fn delete_network(&self, name: &str);

    /// The network currently known under `name`
    async fn get_network(&self, name: &str) -> Option<Network>;
}
