/// Annotation on a NetworkAttachmentDefinition listing the route
/// advertisements that select the network
pub const ROUTE_ADVERTISEMENTS: &str = "k8s.ovn.org/route-advertisements";

/// Kind reported when recording events against attachment definitions
pub const NAD_KIND: &str = "NetworkAttachmentDefinition";
