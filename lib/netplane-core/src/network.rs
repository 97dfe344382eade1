//! Logical network descriptors

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Name of the cluster default network
pub const DEFAULT_NETWORK_NAME: &str = "default";

/// Default MTU for networks that don't set one
pub const DEFAULT_MTU: u32 = 1400;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Layer3,
    Layer2,
    Localnet,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Layer3 => write!(f, "layer3"),
            Topology::Layer2 => write!(f, "layer2"),
            Topology::Localnet => write!(f, "localnet"),
        }
    }
}

impl FromStr for Topology {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "layer3" => Ok(Topology::Layer3),
            "layer2" => Ok(Topology::Layer2),
            "localnet" => Ok(Topology::Localnet),
            other => Err(CoreError::InvalidConfiguration(format!(
                "unsupported topology {:?}",
                other
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkRole {
    Primary,
    #[default]
    Secondary,
}

impl FromStr for NetworkRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "secondary" => Ok(NetworkRole::Secondary),
            "primary" => Ok(NetworkRole::Primary),
            other => Err(CoreError::InvalidConfiguration(format!(
                "invalid network role {:?}",
                other
            ))),
        }
    }
}

/// A subnet of the network, optionally split into per-node host subnets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subnet {
    pub cidr: IpNetwork,
    pub host_prefix: Option<u8>,
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_prefix {
            Some(prefix) => write!(f, "{}/{}", self.cidr, prefix),
            None => write!(f, "{}", self.cidr),
        }
    }
}

/// Structural configuration of a network. Two networks are compatible when
/// their configurations are equal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    pub name: String,
    pub topology: Topology,
    pub role: NetworkRole,
    pub subnets: Vec<Subnet>,
    pub exclude_subnets: Vec<IpNetwork>,
    pub join_subnets: Vec<IpNetwork>,
    pub mtu: u32,
    pub vlan_id: Option<u16>,
}

/// A cluster-wide logical network and the attachment definitions that
/// reference it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    config: NetworkConfig,
    is_default: bool,
    nads: BTreeSet<String>,
    /// Route advertisement annotation value per referencing NAD
    route_advertisements: BTreeMap<String, String>,
}

impl Network {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            is_default: false,
            nads: BTreeSet::new(),
            route_advertisements: BTreeMap::new(),
        }
    }

    /// Placeholder for the non-isolated cluster default network
    pub fn default_network() -> Self {
        let mut network = Self::new(NetworkConfig {
            name: DEFAULT_NETWORK_NAME.to_string(),
            topology: Topology::Layer3,
            role: NetworkRole::Secondary,
            subnets: Vec::new(),
            exclude_subnets: Vec::new(),
            join_subnets: Vec::new(),
            mtu: DEFAULT_MTU,
            vlan_id: None,
        });
        network.is_default = true;
        network
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn topology(&self) -> Topology {
        self.config.topology
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn is_primary(&self) -> bool {
        !self.is_default && self.config.role == NetworkRole::Primary
    }

    /// Compare configuration only, ignoring references
    pub fn is_compatible(&self, other: &Network) -> bool {
        self.is_default == other.is_default && self.config == other.config
    }

    pub fn nads(&self) -> &BTreeSet<String> {
        &self.nads
    }

    /// Whether no NAD other than `key` references this network
    pub fn is_only_referenced_by(&self, key: &str) -> bool {
        self.nads.iter().all(|nad| nad == key)
    }

    pub fn add_nad(&mut self, key: &str) {
        self.nads.insert(key.to_string());
    }

    pub fn delete_nad(&mut self, key: &str) {
        self.nads.remove(key);
        self.route_advertisements.remove(key);
    }

    /// Replace the references with exactly `keys`
    pub fn set_nads<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nads = keys.into_iter().map(Into::into).collect();
        let nads = &self.nads;
        self.route_advertisements.retain(|key, _| nads.contains(key));
    }

    pub fn route_advertisements(&self) -> &BTreeMap<String, String> {
        &self.route_advertisements
    }

    pub fn set_route_advertisements(&mut self, key: &str, value: Option<String>) {
        match value {
            Some(value) => {
                self.route_advertisements.insert(key.to_string(), value);
            }
            None => {
                self.route_advertisements.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, mtu: u32) -> NetworkConfig {
        NetworkConfig {
            name: name.to_string(),
            topology: Topology::Layer2,
            role: NetworkRole::Secondary,
            subnets: vec![Subnet {
                cidr: "10.100.0.0/16".parse().unwrap(),
                host_prefix: None,
            }],
            exclude_subnets: Vec::new(),
            join_subnets: Vec::new(),
            mtu,
            vlan_id: None,
        }
    }

    #[test]
    fn test_compatibility_ignores_references() {
        let mut a = Network::new(config("blue", 1400));
        let b = Network::new(config("blue", 1400));
        a.add_nad("ns1/nad1");
        a.set_route_advertisements("ns1/nad1", Some("ra1".to_string()));

        assert!(a.is_compatible(&b));
        assert_ne!(a, b);
        assert!(!a.is_compatible(&Network::new(config("blue", 9000))));
    }

    #[test]
    fn test_reference_tracking() {
        let mut net = Network::new(config("blue", 1400));
        assert!(net.is_only_referenced_by("ns1/nad1"));

        net.add_nad("ns1/nad1");
        net.set_route_advertisements("ns1/nad1", Some("ra1".to_string()));
        assert!(net.is_only_referenced_by("ns1/nad1"));

        net.add_nad("ns2/nad1");
        assert!(!net.is_only_referenced_by("ns1/nad1"));

        net.delete_nad("ns1/nad1");
        assert!(!net.nads().contains("ns1/nad1"));
        assert!(net.route_advertisements().is_empty());
    }

    #[test]
    fn test_set_nads_drops_foreign_advertisements() {
        let mut net = Network::new(config("blue", 1400));
        net.add_nad("ns1/nad1");
        net.add_nad("ns2/nad1");
        net.set_route_advertisements("ns2/nad1", Some("ra2".to_string()));

        net.set_nads(["ns1/nad1"]);
        assert_eq!(net.nads().len(), 1);
        assert!(net.route_advertisements().is_empty());
    }

    #[test]
    fn test_default_network_is_not_primary() {
        let net = Network::default_network();
        assert!(net.is_default());
        assert!(!net.is_primary());
        assert_eq!(net.name(), DEFAULT_NETWORK_NAME);
    }

    #[test]
    fn test_parse_topology_and_role() {
        assert_eq!("Layer3".parse::<Topology>().unwrap(), Topology::Layer3);
        assert!("vxlan".parse::<Topology>().is_err());
        assert_eq!("".parse::<NetworkRole>().unwrap(), NetworkRole::Secondary);
        assert_eq!("PRIMARY".parse::<NetworkRole>().unwrap(), NetworkRole::Primary);
    }
}
