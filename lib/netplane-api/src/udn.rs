use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// UserDefinedNetwork describes a network intent for a namespace. The
/// attachment definition backing it is generated elsewhere; the controllers
/// here only read the intent to tell "no primary network" apart from
/// "primary network not processed yet".
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "k8s.ovn.org",
    version = "v1",
    kind = "UserDefinedNetwork",
    plural = "userdefinednetworks",
    namespaced,
    derive = "Default",
)]
pub struct UserDefinedNetworkSpec {
    /// Network topology
    pub topology: UdnTopology,

    /// Layer3 configuration, set when topology is Layer3
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer3: Option<Layer3Config>,

    /// Layer2 configuration, set when topology is Layer2
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer2: Option<Layer2Config>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum UdnTopology {
    #[default]
    Layer2,
    Layer3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum UdnRole {
    Primary,
    #[default]
    Secondary,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Layer3Config {
    pub role: UdnRole,

    /// Subnets to allocate node subnets from
    #[serde(default)]
    pub subnets: Vec<Layer3Subnet>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Layer3Subnet {
    pub cidr: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_subnet: Option<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Layer2Config {
    pub role: UdnRole,

    #[serde(default)]
    pub subnets: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

impl UserDefinedNetworkSpec {
    /// Whether this intent asks for the namespace's primary network
    pub fn is_primary_network(&self) -> bool {
        let role = match self.topology {
            UdnTopology::Layer3 => self.layer3.as_ref().map(|l3| l3.role),
            UdnTopology::Layer2 => self.layer2.as_ref().map(|l2| l2.role),
        };
        role == Some(UdnRole::Primary)
    }
}
