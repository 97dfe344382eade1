//! Kubernetes API types consumed by the netplane controllers
//!
//! This library defines the custom resources the control plane watches:
//! - NetworkAttachmentDefinition: namespaced declarations carrying a CNI
//!   network configuration
//! - UserDefinedNetwork: namespaced network intents, consulted to detect a
//!   primary network whose attachment has not been processed yet

pub mod annotations;
pub mod k8s_cni;
pub mod udn;

pub use k8s_cni::{NetworkAttachmentDefinition, NetworkAttachmentDefinitionSpec};
pub use udn::{UserDefinedNetwork, UserDefinedNetworkSpec};
