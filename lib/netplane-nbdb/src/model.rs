//! Typed rows of the northbound tables touched by load balancer reconciliation

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Selection field values for `Load_Balancer.selection_fields`
pub mod selection_fields {
    pub const IP_DST: &str = "ip_dst";
    pub const IP_SRC: &str = "ip_src";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    LoadBalancer,
    LogicalSwitch,
    LogicalRouter,
    LoadBalancerGroup,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::LoadBalancer => "Load_Balancer",
            Table::LogicalSwitch => "Logical_Switch",
            Table::LogicalRouter => "Logical_Router",
            Table::LoadBalancerGroup => "Load_Balancer_Group",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of the Load_Balancer table
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub uuid: String,
    pub name: String,
    pub protocol: Option<String>,
    pub selection_fields: Vec<String>,
    /// VIP ("ip:port") to comma separated backends
    pub vips: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

/// Build a load balancer row without a UUID
pub fn build_load_balancer(
    name: &str,
    protocol: &str,
    selection_fields: Vec<String>,
    vips: BTreeMap<String, String>,
    options: BTreeMap<String, String>,
    external_ids: BTreeMap<String, String>,
) -> LoadBalancer {
    LoadBalancer {
        uuid: String::new(),
        name: name.to_string(),
        protocol: Some(protocol.to_string()),
        selection_fields,
        vips,
        options,
        external_ids,
    }
}

/// Row of the Logical_Switch table (load balancer columns only)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSwitch {
    pub uuid: String,
    pub name: String,
    pub load_balancer: BTreeSet<String>,
}

/// Row of the Logical_Router table (load balancer columns only)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRouter {
    pub uuid: String,
    pub name: String,
    pub load_balancer: BTreeSet<String>,
}

/// Row of the Load_Balancer_Group table
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerGroup {
    pub uuid: String,
    pub name: String,
    pub load_balancer: BTreeSet<String>,
}

/// A table whose rows hold a set of references to load balancers
pub trait LoadBalancerHolder: Clone + Send + Sync {
    const TABLE: Table;

    /// Stub row that only carries identity, used as an operation target
    fn stub(name: &str, uuid: Option<&str>) -> Self;
    fn uuid(&self) -> &str;
    fn name(&self) -> &str;
    fn load_balancers(&self) -> &BTreeSet<String>;
    fn load_balancers_mut(&mut self) -> &mut BTreeSet<String>;
}

macro_rules! impl_load_balancer_holder {
    ($row:ty, $table:expr) => {
        impl LoadBalancerHolder for $row {
            const TABLE: Table = $table;

            fn stub(name: &str, uuid: Option<&str>) -> Self {
                Self {
                    uuid: uuid.unwrap_or_default().to_string(),
                    name: name.to_string(),
                    load_balancer: BTreeSet::new(),
                }
            }

            fn uuid(&self) -> &str {
                &self.uuid
            }

            fn name(&self) -> &str {
                &self.name
            }

            fn load_balancers(&self) -> &BTreeSet<String> {
                &self.load_balancer
            }

            fn load_balancers_mut(&mut self) -> &mut BTreeSet<String> {
                &mut self.load_balancer
            }
        }
    };
}

impl_load_balancer_holder!(LogicalSwitch, Table::LogicalSwitch);
impl_load_balancer_holder!(LogicalRouter, Table::LogicalRouter);
impl_load_balancer_holder!(LoadBalancerGroup, Table::LoadBalancerGroup);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert_eq!(Table::LoadBalancer.to_string(), "Load_Balancer");
        assert_eq!(Table::LoadBalancerGroup.as_str(), "Load_Balancer_Group");
    }

    #[test]
    fn test_holder_stub() {
        let sw = LogicalSwitch::stub("node1", None);
        assert_eq!(sw.name(), "node1");
        assert!(sw.uuid().is_empty());
        assert!(sw.load_balancers().is_empty());

        let rtr = LogicalRouter::stub("GR_node1", Some("abc"));
        assert_eq!(rtr.uuid(), "abc");
        assert_eq!(LogicalRouter::TABLE, Table::LogicalRouter);
    }
}
