//! Read access to cached Kubernetes objects

use netplane_api::{NetworkAttachmentDefinition, UserDefinedNetwork};
use std::sync::Arc;

use crate::Result;

/// Cached attachment definitions
pub trait NadLister: Send + Sync {
    fn list(&self) -> Result<Vec<Arc<NetworkAttachmentDefinition>>>;

    /// `None` when the definition does not exist
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<NetworkAttachmentDefinition>>>;
}

/// Cached user defined networks
pub trait UdnLister: Send + Sync {
    fn list(&self, namespace: &str) -> Result<Vec<Arc<UserDefinedNetwork>>>;
}
