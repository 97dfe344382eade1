use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// NetworkAttachmentDefinition declares how pods in a namespace attach to a
/// network. The network itself is described by the CNI configuration carried
/// in `config`; several definitions may describe the same network as long as
/// their configurations agree.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    plural = "network-attachment-definitions",
    shortname = "net-attach-def",
    namespaced,
    derive = "Default",
)]
pub struct NetworkAttachmentDefinitionSpec {
    /// Raw CNI network configuration (JSON)
    #[serde(default)]
    pub config: String,
}

impl NetworkAttachmentDefinition {
    /// Build a definition in `namespace` carrying the given CNI config
    pub fn with_config(namespace: &str, name: &str, config: impl Into<String>) -> Self {
        let mut nad = NetworkAttachmentDefinition::new(
            name,
            NetworkAttachmentDefinitionSpec {
                config: config.into(),
            },
        );
        nad.metadata.namespace = Some(namespace.to_string());
        nad
    }
}
