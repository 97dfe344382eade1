//! CNI network configuration carried by attachment definitions

use ipnetwork::IpNetwork;
use kube::ResourceExt;
use netplane_api::annotations::ROUTE_ADVERTISEMENTS;
use netplane_api::NetworkAttachmentDefinition;
use serde::Deserialize;

use crate::network::{
    Network, NetworkConfig, NetworkRole, Subnet, Topology, DEFAULT_MTU, DEFAULT_NETWORK_NAME,
};
use crate::{CoreError, Result};

/// CNI plugin type of networks handled by this controller
pub const OVN_K8S_CNI_OVERLAY: &str = "ovn-k8s-cni-overlay";

const DEFAULT_V4_HOST_PREFIX: u8 = 24;
const DEFAULT_V6_HOST_PREFIX: u8 = 64;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetConf {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    cni_type: String,
    #[serde(default)]
    topology: String,
    #[serde(default)]
    subnets: String,
    #[serde(default)]
    exclude_subnets: String,
    #[serde(default)]
    join_subnet: String,
    #[serde(default)]
    mtu: Option<u32>,
    #[serde(default)]
    role: String,
    #[serde(default)]
    net_attach_def_name: String,
    #[serde(rename = "vlanID", default)]
    vlan_id: Option<u16>,
}

/// Network described by an attachment definition, plus the attributes that
/// travel with the definition rather than the network
#[derive(Clone, Debug)]
pub struct ParsedNad {
    pub network: Network,
    pub route_advertisements: Option<String>,
}

/// Parse the attachment definition stored under `key`
pub fn parse_nad(key: &str, nad: &NetworkAttachmentDefinition) -> Result<ParsedNad> {
    let network = parse_net_conf(key, &nad.spec.config)?;
    let route_advertisements = nad.annotations().get(ROUTE_ADVERTISEMENTS).cloned();
    Ok(ParsedNad {
        network,
        route_advertisements,
    })
}

/// Parse and validate a CNI config document into a network descriptor
pub fn parse_net_conf(key: &str, config: &str) -> Result<Network> {
    let conf: NetConf = serde_json::from_str(config).map_err(|e| {
        CoreError::InvalidConfiguration(format!("failed to unmarshal CNI config: {}", e))
    })?;

    if conf.cni_type != OVN_K8S_CNI_OVERLAY {
        return Err(CoreError::NotManaged(key.to_string()));
    }
    if conf.name.is_empty() {
        return Err(invalid("missing network name"));
    }
    if conf.name == DEFAULT_NETWORK_NAME {
        return Err(invalid(format!(
            "network name {:?} is reserved",
            DEFAULT_NETWORK_NAME
        )));
    }
    if !conf.net_attach_def_name.is_empty() && conf.net_attach_def_name != key {
        return Err(invalid(format!(
            "netAttachDefName {} does not match {}",
            conf.net_attach_def_name, key
        )));
    }

    let topology: Topology = conf.topology.parse()?;
    let role: NetworkRole = conf.role.parse()?;
    if role == NetworkRole::Primary && topology == Topology::Localnet {
        return Err(invalid("localnet networks can't have the primary role"));
    }

    let subnets = parse_subnets(&conf.subnets, topology)?;
    if topology == Topology::Layer3 && subnets.is_empty() {
        return Err(invalid("layer3 networks require subnets"));
    }
    if role == NetworkRole::Primary && subnets.is_empty() {
        return Err(invalid("primary networks require subnets"));
    }

    let exclude_subnets = parse_cidrs(&conf.exclude_subnets)?;
    for excluded in &exclude_subnets {
        let contained = subnets.iter().any(|subnet| {
            subnet.cidr.contains(excluded.network()) && excluded.prefix() >= subnet.cidr.prefix()
        });
        if !contained {
            return Err(invalid(format!(
                "excluded subnet {} is not contained in any subnet",
                excluded
            )));
        }
    }

    let join_subnets = parse_cidrs(&conf.join_subnet)?;
    if !join_subnets.is_empty() && role != NetworkRole::Primary {
        return Err(invalid("join subnets only apply to primary networks"));
    }

    if conf.vlan_id.is_some() && topology != Topology::Localnet {
        return Err(invalid("VLAN IDs are only supported on localnet networks"));
    }

    Ok(Network::new(NetworkConfig {
        name: conf.name,
        topology,
        role,
        subnets,
        exclude_subnets,
        join_subnets,
        mtu: conf.mtu.filter(|mtu| *mtu != 0).unwrap_or(DEFAULT_MTU),
        vlan_id: conf.vlan_id,
    }))
}

fn invalid(msg: impl Into<String>) -> CoreError {
    CoreError::InvalidConfiguration(msg.into())
}

fn entries(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse a CIDR and normalize it to its network address
fn parse_cidr(s: &str) -> Result<IpNetwork> {
    let cidr: IpNetwork = s
        .parse()
        .map_err(|e| invalid(format!("invalid CIDR {:?}: {}", s, e)))?;
    IpNetwork::new(cidr.network(), cidr.prefix())
        .map_err(|e| invalid(format!("invalid CIDR {:?}: {}", s, e)))
}

fn parse_cidrs(list: &str) -> Result<Vec<IpNetwork>> {
    entries(list).map(parse_cidr).collect()
}

/// Layer3 subnets take an optional host prefix ("10.128.0.0/16/24") and
/// default to /24 (IPv4) or /64 (IPv6) per node.
fn parse_subnets(list: &str, topology: Topology) -> Result<Vec<Subnet>> {
    entries(list)
        .map(|entry| {
            let parts: Vec<&str> = entry.split('/').collect();
            let (cidr, host_prefix) = match parts.len() {
                2 => (parse_cidr(entry)?, None),
                3 if topology == Topology::Layer3 => {
                    let prefix = parts[2]
                        .parse::<u8>()
                        .map_err(|_| invalid(format!("invalid host prefix in {:?}", entry)))?;
                    (parse_cidr(&format!("{}/{}", parts[0], parts[1]))?, Some(prefix))
                }
                _ => return Err(invalid(format!("invalid subnet {:?}", entry))),
            };

            if topology != Topology::Layer3 {
                return Ok(Subnet {
                    cidr,
                    host_prefix: None,
                });
            }

            let (default_prefix, max_prefix) = if cidr.is_ipv4() {
                (DEFAULT_V4_HOST_PREFIX, 32)
            } else {
                (DEFAULT_V6_HOST_PREFIX, 128)
            };
            let host_prefix = host_prefix.unwrap_or(default_prefix);
            if host_prefix <= cidr.prefix() || host_prefix > max_prefix {
                return Err(invalid(format!(
                    "host prefix /{} is not valid for subnet {}",
                    host_prefix, cidr
                )));
            }
            Ok(Subnet {
                cidr,
                host_prefix: Some(host_prefix),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ns1/nad1";

    fn conf(extra: &str) -> String {
        format!(
            r#"{{"cniVersion":"0.4.0","name":"blue","type":"ovn-k8s-cni-overlay"{}}}"#,
            extra
        )
    }

    #[test]
    fn test_parse_layer3_primary() {
        let net = parse_net_conf(
            KEY,
            &conf(r#","topology":"layer3","subnets":"10.128.0.0/16/24","role":"primary","netAttachDefName":"ns1/nad1""#),
        )
        .unwrap();

        assert_eq!(net.name(), "blue");
        assert_eq!(net.topology(), Topology::Layer3);
        assert!(net.is_primary());
        assert_eq!(net.config().mtu, DEFAULT_MTU);
        assert_eq!(net.config().subnets[0].to_string(), "10.128.0.0/16/24");
    }

    #[test]
    fn test_layer3_default_host_prefix_matches_explicit() {
        let implicit =
            parse_net_conf(KEY, &conf(r#","topology":"layer3","subnets":"10.128.0.5/16""#)).unwrap();
        let explicit =
            parse_net_conf(KEY, &conf(r#","topology":"layer3","subnets":"10.128.0.0/16/24""#))
                .unwrap();
        assert!(implicit.is_compatible(&explicit));
    }

    #[test]
    fn test_parse_layer2_secondary_without_subnets() {
        let net = parse_net_conf(KEY, &conf(r#","topology":"layer2","mtu":9000"#)).unwrap();
        assert!(!net.is_primary());
        assert!(net.config().subnets.is_empty());
        assert_eq!(net.config().mtu, 9000);
    }

    #[test]
    fn test_foreign_cni_type_is_not_managed() {
        let err = parse_net_conf(KEY, r#"{"name":"macvlan-conf","type":"macvlan"}"#).unwrap_err();
        assert!(matches!(err, CoreError::NotManaged(_)));
    }

    #[test]
    fn test_rejections() {
        let cases = [
            "not json".to_string(),
            r#"{"type":"ovn-k8s-cni-overlay","topology":"layer2"}"#.to_string(),
            r#"{"name":"default","type":"ovn-k8s-cni-overlay","topology":"layer2"}"#.to_string(),
            conf(r#","topology":"layer2","netAttachDefName":"ns2/other""#),
            conf(r#","topology":"vxlan""#),
            conf(r#","topology":"layer3""#),
            conf(r#","topology":"localnet","role":"primary","subnets":"10.0.0.0/24""#),
            conf(r#","topology":"layer2","role":"primary""#),
            conf(r#","topology":"layer2","subnets":"10.0.0.0/16/24""#),
            conf(r#","topology":"layer3","subnets":"10.0.0.0/24/16""#),
            conf(r#","topology":"layer2","subnets":"10.0.0.0/24","excludeSubnets":"10.1.0.0/28""#),
            conf(r#","topology":"layer2","subnets":"10.0.0.0/24","joinSubnet":"100.65.0.0/16""#),
            conf(r#","topology":"layer2","vlanID":10"#),
        ];
        for config in cases {
            let err = parse_net_conf(KEY, &config).unwrap_err();
            assert!(
                matches!(err, CoreError::InvalidConfiguration(_)),
                "{} -> {:?}",
                config,
                err
            );
        }
    }

    #[test]
    fn test_exclude_subnets_within_subnet() {
        let net = parse_net_conf(
            KEY,
            &conf(r#","topology":"layer2","subnets":"10.0.0.0/24, fd00::/64","excludeSubnets":"10.0.0.0/28""#),
        )
        .unwrap();
        assert_eq!(net.config().subnets.len(), 2);
        assert_eq!(net.config().exclude_subnets.len(), 1);
    }

    #[test]
    fn test_localnet_vlan() {
        let net =
            parse_net_conf(KEY, &conf(r#","topology":"localnet","vlanID":20"#)).unwrap();
        assert_eq!(net.config().vlan_id, Some(20));
    }

    #[test]
    fn test_parse_nad_reads_route_advertisements() {
        let mut nad = NetworkAttachmentDefinition::with_config(
            "ns1",
            "nad1",
            conf(r#","topology":"layer2""#),
        );
        nad.annotations_mut()
            .insert(ROUTE_ADVERTISEMENTS.to_string(), "[\"default\"]".to_string());

        let parsed = parse_nad(KEY, &nad).unwrap();
        assert_eq!(parsed.route_advertisements.as_deref(), Some("[\"default\"]"));
        assert_eq!(parsed.network.name(), "blue");
    }
}
