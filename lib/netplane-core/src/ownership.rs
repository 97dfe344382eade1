//! Which attachment definitions own which networks

use std::collections::HashMap;

/// Ownership state of the NAD controller. Callers serialize access.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnershipRegistry {
    // NAD key to network name
    nads: HashMap<String, String>,
    // Namespace to the key of its primary NAD
    primary_nads: HashMap<String, String>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network name bound to `key`, empty when unbound
    pub fn network_for(&self, key: &str) -> &str {
        self.nads.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn bind(&mut self, key: &str, network: &str) {
        self.nads.insert(key.to_string(), network.to_string());
    }

    pub fn unbind(&mut self, key: &str) {
        self.nads.remove(key);
    }

    /// Key of the primary NAD of `namespace`, if any
    pub fn primary_for(&self, namespace: &str) -> Option<&str> {
        self.primary_nads.get(namespace).map(String::as_str)
    }

    pub fn set_primary(&mut self, namespace: &str, key: &str) {
        self.primary_nads
            .insert(namespace.to_string(), key.to_string());
    }

    /// Forget the primary of `namespace` if it is `key`
    pub fn clear_primary_if(&mut self, namespace: &str, key: &str) {
        if self.primary_for(namespace) == Some(key) {
            self.primary_nads.remove(namespace);
        }
    }

    pub fn nads(&self) -> &HashMap<String, String> {
        &self.nads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings() {
        let mut reg = OwnershipRegistry::new();
        assert_eq!(reg.network_for("ns1/nad1"), "");

        reg.bind("ns1/nad1", "blue");
        reg.set_primary("ns1", "ns1/nad1");
        assert_eq!(reg.network_for("ns1/nad1"), "blue");
        assert_eq!(reg.primary_for("ns1"), Some("ns1/nad1"));

        reg.clear_primary_if("ns1", "ns1/other");
        assert_eq!(reg.primary_for("ns1"), Some("ns1/nad1"));
        reg.clear_primary_if("ns1", "ns1/nad1");
        assert_eq!(reg.primary_for("ns1"), None);

        reg.unbind("ns1/nad1");
        assert!(reg.nads().is_empty());
    }
}
