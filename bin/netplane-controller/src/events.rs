//! Warning events published to the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use netplane_core::events::{EventRecorder, ObjectRef};
use tracing::warn;

const NAD_API_VERSION: &str = "k8s.cni.cncf.io/v1";

pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("HOSTNAME").ok(),
            },
        }
    }
}

fn object_reference(object: &ObjectRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(NAD_API_VERSION.to_string()),
        kind: Some(object.kind.clone()),
        namespace: Some(object.namespace.clone()),
        name: Some(object.name.clone()),
        ..Default::default()
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn warning(&self, object: &ObjectRef, reason: &str, note: String) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            object_reference(object),
        );
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Sync".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!("Failed to record event for {}: {}", object, e);
        }
    }
}
