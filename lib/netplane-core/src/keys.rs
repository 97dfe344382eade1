//! Namespace-qualified object keys ("namespace/name")

use kube::{Resource, ResourceExt};

use crate::{CoreError, Result};

/// Key of a namespaced or cluster-scoped object
pub fn meta_namespace_key<K: Resource>(obj: &K) -> Result<String> {
    let name = obj.meta().name.as_deref().unwrap_or_default();
    if name.is_empty() {
        return Err(CoreError::InvalidKey("object has no name".to_string()));
    }
    Ok(match obj.namespace() {
        Some(namespace) if !namespace.is_empty() => format!("{}/{}", namespace, name),
        _ => name.to_string(),
    })
}

/// Split a key into (namespace, name); cluster-scoped keys have an empty
/// namespace
pub fn split_meta_namespace_key(key: &str) -> Result<(&str, &str)> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok(("", name)),
        (Some(namespace), Some(name), None) if !name.is_empty() => Ok((namespace, name)),
        _ => Err(CoreError::InvalidKey(format!(
            "unexpected key format: {:?}",
            key
        ))),
    }
}
