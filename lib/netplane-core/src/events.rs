//! Kubernetes events raised by the reconcilers

use async_trait::async_trait;
use std::fmt;

/// Reason of the warning raised for an unparsable attachment definition
pub const INVALID_CONFIG_REASON: &str = "InvalidConfig";

/// Object an event is recorded against
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Sink for warning events
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn warning(&self, object: &ObjectRef, reason: &str, note: String);
}
