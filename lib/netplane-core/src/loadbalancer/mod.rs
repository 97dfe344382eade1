//! Load balancer set reconciliation
//!
//! Owners describe the complete set of load balancers they want for an
//! ownership tag (a set of external IDs). `LbReconciler::ensure_lbs` diffs
//! that set against the northbound database and commits the difference,
//! including switch, router and group attachments, in one transaction.

mod reconciler;

pub use reconciler::{build_lb, build_vip_map, DeleteVipEntry, LbReconciler};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Desired load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lb {
    /// Set by callers that track the row they last committed; ignored when
    /// comparing desired state
    pub uuid: String,
    /// Natural key within an ownership tag
    pub name: String,
    /// "TCP", "UDP" or "SCTP", any case
    pub protocol: String,
    pub external_ids: BTreeMap<String, String>,
    pub opts: LbOpts,
    pub rules: Vec<LbRule>,

    /// Names of the switches, routers and groups the load balancer must be
    /// attached to
    pub switches: Vec<String>,
    pub routers: Vec<String>,
    pub groups: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbOpts {
    /// Emit an event instead of rejecting when there are no backends
    pub unidling: bool,
    /// Pin clients to a backend by source and destination IP
    pub affinity: bool,
    pub skip_snat: bool,
}

/// Traffic to `source` is balanced over `targets`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbRule {
    pub source: Addr,
    pub targets: Vec<Addr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    pub ip: IpAddr,
    pub port: u16,
}

impl Addr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

/// "ip:port", with IPv6 addresses in brackets
impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))
    }
}

impl Lb {
    fn eq_ignoring_uuid(&self, other: &Lb) -> bool {
        Lb {
            uuid: String::new(),
            ..self.clone()
        } == Lb {
            uuid: String::new(),
            ..other.clone()
        }
    }
}

/// Whether two lists describe the same load balancers in the same order,
/// whatever their UUIDs
pub fn load_balancers_equal_no_uuid(a: &[Lb], b: &[Lb]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignoring_uuid(y))
}
