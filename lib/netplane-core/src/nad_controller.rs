//! NAD controller
//!
//! Resolves namespaced network attachment definitions into cluster-wide
//! networks. Several definitions may share a network as long as their CNI
//! configurations agree; the network lives as long as one definition
//! references it. Each namespace has at most one primary definition.

use kube::{Resource, ResourceExt};
use netplane_api::annotations::{NAD_KIND, ROUTE_ADVERTISEMENTS};
use netplane_api::NetworkAttachmentDefinition;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::events::{EventRecorder, ObjectRef, INVALID_CONFIG_REASON};
use crate::keys::{meta_namespace_key, split_meta_namespace_key};
use crate::listers::{NadLister, UdnLister};
use crate::metrics::{result_label, ReconcilerMetrics};
use crate::netconf::{parse_nad, ParsedNad};
use crate::ownership::OwnershipRegistry;
use crate::{CoreError, Network, NetworkManager, Result};

/// Where the controller runs. Only the cluster manager records events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NadControllerKind {
    Cluster,
    Zone(String),
    Node(String),
}

impl NadControllerKind {
    fn records_events(&self) -> bool {
        matches!(self, NadControllerKind::Cluster)
    }
}

impl fmt::Display for NadControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NadControllerKind::Cluster => write!(f, "cluster"),
            NadControllerKind::Zone(zone) => write!(f, "zone {}", zone),
            NadControllerKind::Node(node) => write!(f, "node {}", node),
        }
    }
}

/// How a sync relates the definition to the network registered under its
/// network name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resolution {
    /// No network under that name yet
    Create,
    /// Existing network with an equal configuration
    Attach,
    /// Existing network referenced by this definition only, replaced
    Recreate,
    /// Existing incompatible network this definition already referenced
    DetachAndConflict,
    /// Existing incompatible network referenced by others
    Conflict,
}

struct Candidates<'a> {
    key: &'a str,
    parsed: Option<&'a Network>,
    current: Option<&'a Network>,
    previous: Option<&'a Network>,
}

type Rule = (fn(&Candidates<'_>) -> bool, Resolution);

fn is_absent(c: &Candidates<'_>) -> bool {
    c.current.is_none()
}

fn is_compatible(c: &Candidates<'_>) -> bool {
    match (c.current, c.parsed) {
        (Some(current), Some(parsed)) => current.is_compatible(parsed),
        _ => false,
    }
}

fn is_sole_reference(c: &Candidates<'_>) -> bool {
    c.current
        .map_or(false, |current| current.is_only_referenced_by(c.key))
}

fn has_no_previous(c: &Candidates<'_>) -> bool {
    c.previous.is_none()
}

fn always(_: &Candidates<'_>) -> bool {
    true
}

/// Evaluated in order, first match wins
const RULES: [Rule; 5] = [
    (is_absent, Resolution::Create),
    (is_compatible, Resolution::Attach),
    (is_sole_reference, Resolution::Recreate),
    (has_no_previous, Resolution::DetachAndConflict),
    (always, Resolution::Conflict),
];

fn resolve(candidates: &Candidates<'_>) -> Resolution {
    RULES
        .iter()
        .find(|(applies, _)| applies(candidates))
        .map(|(_, resolution)| *resolution)
        .unwrap_or(Resolution::Conflict)
}

/// NadController keeps networks in sync with the attachment definitions
/// that reference them
pub struct NadController {
    name: String,
    kind: NadControllerKind,
    network_segmentation: bool,
    manager: Arc<dyn NetworkManager>,
    nad_lister: Arc<dyn NadLister>,
    udn_lister: Option<Arc<dyn UdnLister>>,
    recorder: Option<Arc<dyn EventRecorder>>,
    metrics: Option<ReconcilerMetrics>,
    ownership: RwLock<OwnershipRegistry>,
}

impl NadController {
    pub fn new(
        name: &str,
        kind: NadControllerKind,
        manager: Arc<dyn NetworkManager>,
        nad_lister: Arc<dyn NadLister>,
    ) -> Self {
        Self {
            name: format!("[{} NAD controller]", name),
            kind,
            network_segmentation: true,
            manager,
            nad_lister,
            udn_lister: None,
            recorder: None,
            metrics: None,
            ownership: RwLock::new(OwnershipRegistry::new()),
        }
    }

    /// Enable or disable user defined network segmentation. When disabled
    /// every namespace is on the default network.
    pub fn with_network_segmentation(mut self, enabled: bool) -> Self {
        self.network_segmentation = enabled;
        self
    }

    pub fn with_udn_lister(mut self, lister: Arc<dyn UdnLister>) -> Self {
        self.udn_lister = Some(lister);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_metrics(mut self, metrics: ReconcilerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NadControllerKind {
        &self.kind
    }

    /// Copy of the current ownership state
    pub async fn ownership(&self) -> OwnershipRegistry {
        self.ownership.read().await.clone()
    }

    /// Sync every cached definition. Networks are ensured with their full
    /// set of references before per-key processing starts.
    pub async fn sync_all(&self) -> Result<()> {
        let nads = self.nad_lister.list().map_err(|e| {
            error!("{}: failed to list NADs: {}", self.name, e);
            e
        })?;
        info!("{}: initial sync of {} NADs", self.name, nads.len());

        for nad in nads {
            let key = match meta_namespace_key(&*nad) {
                Ok(key) => key,
                Err(e) => {
                    error!("{}: failed to sync {:?}: {}", self.name, nad.name_any(), e);
                    continue;
                }
            };
            if let Err(e) = self.sync_nad(&key, Some(&*nad)).await {
                error!("{}: failed to sync {}: {}", self.name, key, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Sync the definition stored under `key`, as delivered by the work
    /// queue. A definition missing from the cache is a deletion.
    pub async fn sync(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        debug!("{}: sync NAD {}", self.name, key);

        let (namespace, name) = match split_meta_namespace_key(key) {
            Ok(parts) => parts,
            Err(e) => {
                error!("{}: failed splitting key {}: {}", self.name, key, e);
                return Ok(());
            }
        };

        let result = match self.nad_lister.get(namespace, name) {
            Ok(nad) => self.sync_nad(key, nad.as_deref()).await,
            Err(e) => Err(e),
        };

        let elapsed = start.elapsed();
        debug!(
            "{}: finished syncing NAD {}, took {:?}",
            self.name, key, elapsed
        );
        if let Some(metrics) = &self.metrics {
            metrics.observe_nad_sync(&self.name, result_label(&result), elapsed.as_secs_f64());
        }
        result
    }

    /// Reconcile one definition; `None` means it was deleted. Safe to repeat.
    pub async fn sync_nad(&self, key: &str, nad: Option<&NetworkAttachmentDefinition>) -> Result<()> {
        let (namespace, _) = split_meta_namespace_key(key)?;

        let parsed = match nad {
            Some(nad) => match parse_nad(key, nad) {
                Ok(parsed) => Some(parsed),
                Err(CoreError::NotManaged(_)) => {
                    debug!("{}: NAD {} is not managed, skipping", self.name, key);
                    return Ok(());
                }
                Err(e) => {
                    self.record_invalid_config(nad, &e).await;
                    error!("{}: failed parsing NAD {}: {}", self.name, key, e);
                    return Ok(());
                }
            },
            None => None,
        };
        let parsed_network = parsed.as_ref().map(|p| &p.network);
        let network_name = parsed_network.map(Network::name).unwrap_or_default();

        let mut state = self.ownership.write().await;

        if parsed_network.map_or(false, Network::is_primary) {
            if let Some(existing) = state.primary_for(namespace) {
                if existing != key {
                    return Err(CoreError::PrimaryConflict {
                        controller: self.name.clone(),
                        existing: existing.to_string(),
                        key: key.to_string(),
                    });
                }
            }
        }

        let bound = state.network_for(key).to_string();
        let previous = if network_name != bound {
            self.lookup(&bound).await
        } else {
            None
        };
        let current = self.lookup(network_name).await;

        let resolution = resolve(&Candidates {
            key,
            parsed: parsed_network,
            current: current.as_ref(),
            previous: previous.as_ref(),
        });
        debug!(
            "{}: NAD {} resolved to {:?} for network {:?}",
            self.name, key, resolution, network_name
        );

        let conflict = || CoreError::NetworkConflict {
            controller: self.name.clone(),
            key: key.to_string(),
            network: network_name.to_string(),
        };
        let (stale, target, failure) = match resolution {
            Resolution::Create => (previous, parsed_network.cloned(), None),
            Resolution::Attach => (previous, current, None),
            Resolution::Recreate => (current, parsed_network.cloned(), None),
            Resolution::DetachAndConflict => (current, None, Some(conflict())),
            Resolution::Conflict => (previous, None, Some(conflict())),
        };

        if let Some(mut stale) = stale {
            stale.delete_nad(key);
            if stale.nads().is_empty() {
                info!("{}: deleting network {}", self.name, stale.name());
                self.manager.delete_network(stale.name()).await;
            } else {
                self.manager.ensure_network(stale).await;
            }
        }

        let Some(mut target) = target else {
            state.unbind(key);
            state.clear_primary_if(namespace, key);
            return match failure {
                Some(e) => {
                    warn!("{}", e);
                    Err(e)
                }
                None => Ok(()),
            };
        };

        target.add_nad(key);
        target.set_route_advertisements(
            key,
            parsed.and_then(|ParsedNad { route_advertisements, .. }| route_advertisements),
        );
        state.bind(key, target.name());
        if target.is_primary() {
            state.set_primary(namespace, key);
        } else {
            state.clear_primary_if(namespace, key);
        }

        // Ensure even when nothing changed here: attributes outside the
        // network identity, like route advertisements, may have.
        self.manager.ensure_network(target).await;
        Ok(())
    }

    /// The network pods of `namespace` attach to by default
    pub async fn get_active_network_for_namespace(&self, namespace: &str) -> Result<Network> {
        if !self.network_segmentation {
            return Ok(Network::default_network());
        }

        let state = self.ownership.read().await;
        if let Some(primary) = state.primary_for(namespace) {
            let network_name = state.network_for(primary);
            if network_name.is_empty() {
                panic!(
                    "{}: broken consistency between primary NADs and cached NADs",
                    self.name
                );
            }
            let mut network = self.lookup(network_name).await.ok_or_else(|| {
                CoreError::Internal(format!(
                    "{}: network {} of primary NAD {} is not registered",
                    self.name, network_name, primary
                ))
            })?;
            network.set_nads([primary]);
            return Ok(network);
        }

        // No primary network found, make sure none is pending
        if let Some(udns) = &self.udn_lister {
            for udn in udns.list(namespace)? {
                if udn.spec.is_primary_network() {
                    return Err(CoreError::UnprocessedActiveNetwork {
                        namespace: namespace.to_string(),
                        name: udn.name_any(),
                    });
                }
            }
        }

        Ok(Network::default_network())
    }

    async fn lookup(&self, name: &str) -> Option<Network> {
        if name.is_empty() {
            return None;
        }
        self.manager.get_network(name).await
    }

    async fn record_invalid_config(&self, nad: &NetworkAttachmentDefinition, err: &CoreError) {
        if !self.kind.records_events() {
            return;
        }
        let Some(recorder) = &self.recorder else {
            return;
        };
        let object = ObjectRef {
            kind: NAD_KIND.to_string(),
            namespace: nad.namespace().unwrap_or_default(),
            name: nad.name_any(),
        };
        recorder
            .warning(
                &object,
                INVALID_CONFIG_REASON,
                format!("Failed to parse network config: {}", err),
            )
            .await;
    }
}

/// Whether a watch update must be queued. Resyncs and objects being deleted
/// are skipped; otherwise the spec or the route advertisements must differ.
pub fn nad_needs_update(
    old: Option<&NetworkAttachmentDefinition>,
    new: Option<&NetworkAttachmentDefinition>,
) -> bool {
    let (Some(old), Some(new)) = (old, new) else {
        return true;
    };

    if old.resource_version() == new.resource_version()
        || new.meta().deletion_timestamp.is_some()
    {
        return false;
    }

    old.spec != new.spec
        || old.annotations().get(ROUTE_ADVERTISEMENTS) != new.annotations().get(ROUTE_ADVERTISEMENTS)
}
