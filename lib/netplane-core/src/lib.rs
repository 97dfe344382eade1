//! Control-plane core of the netplane SDN controller
//!
//! This library provides:
//! - Network descriptors parsed from attachment definitions
//! - The NAD controller: ownership of networks by attachment definitions
//!   and election of one primary network per namespace
//! - The load balancer set reconciler for the northbound database
//! - Cancellation helpers and reconciler metrics

pub mod context;
pub mod error;
pub mod events;
pub mod keys;
pub mod listers;
pub mod loadbalancer;
pub mod metrics;
pub mod nad_controller;
pub mod netconf;
pub mod network;
pub mod network_manager;
pub mod ownership;
pub mod registry;

pub use error::{CoreError, Result};
pub use loadbalancer::{load_balancers_equal_no_uuid, Lb, LbReconciler};
pub use nad_controller::{nad_needs_update, NadController, NadControllerKind};
pub use network::{Network, NetworkConfig, NetworkRole, Topology};
pub use network_manager::NetworkManager;
pub use registry::NetworkRegistry;
