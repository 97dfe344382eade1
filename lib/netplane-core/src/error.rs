use netplane_nbdb::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid network configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Network attachment definition {0} is not managed by this controller")]
    NotManaged(String),

    #[error("{controller}: NAD {existing} is primary for the namespace, NAD {key} can't be primary")]
    PrimaryConflict {
        controller: String,
        existing: String,
        key: String,
    },

    #[error("{controller}: NAD {key} CNI config does not match that of network {network}")]
    NetworkConflict {
        controller: String,
        key: String,
        network: String,
    },

    #[error("Primary network {name} exists in namespace {namespace} but has not been processed yet")]
    UnprocessedActiveNetwork { namespace: String, name: String },

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Failed to list network attachment definitions: {0}")]
    Listing(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether retrying the same input can succeed. Malformed input cannot.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CoreError::InvalidConfiguration(_)
                | CoreError::NotManaged(_)
                | CoreError::InvalidKey(_)
        )
    }

    /// Whether this is a policy conflict between attachment definitions
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoreError::PrimaryConflict { .. } | CoreError::NetworkConflict { .. }
        )
    }

    pub fn is_unprocessed_active_network(&self) -> bool {
        matches!(self, CoreError::UnprocessedActiveNetwork { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let conflict = CoreError::NetworkConflict {
            controller: "[test NAD controller]".to_string(),
            key: "ns1/nad1".to_string(),
            network: "blue".to_string(),
        };
        assert!(conflict.is_conflict());
        assert!(conflict.is_retryable());
        assert_eq!(
            conflict.to_string(),
            "[test NAD controller]: NAD ns1/nad1 CNI config does not match that of network blue"
        );

        let unprocessed = CoreError::UnprocessedActiveNetwork {
            namespace: "ns1".to_string(),
            name: "udn1".to_string(),
        };
        assert!(unprocessed.is_unprocessed_active_network());
        assert!(unprocessed.is_retryable());

        assert!(!CoreError::InvalidConfiguration("bad".to_string()).is_retryable());
        assert!(!CoreError::InvalidKey("a/b/c".to_string()).is_retryable());
        assert!(CoreError::Store(StoreError::Transaction("boom".to_string())).is_retryable());
    }
}
