//! Listers backed by reflector stores

use kube_runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use netplane_api::{NetworkAttachmentDefinition, UserDefinedNetwork};
use netplane_core::listers::{NadLister, UdnLister};
use netplane_core::Result;
use std::sync::Arc;

pub struct StoreNadLister {
    store: Store<NetworkAttachmentDefinition>,
}

impl StoreNadLister {
    pub fn new(store: Store<NetworkAttachmentDefinition>) -> Self {
        Self { store }
    }
}

impl NadLister for StoreNadLister {
    fn list(&self) -> Result<Vec<Arc<NetworkAttachmentDefinition>>> {
        Ok(self.store.state())
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<NetworkAttachmentDefinition>>> {
        Ok(self.store.get(&ObjectRef::new(name).within(namespace)))
    }
}

pub struct StoreUdnLister {
    store: Store<UserDefinedNetwork>,
}

impl StoreUdnLister {
    pub fn new(store: Store<UserDefinedNetwork>) -> Self {
        Self { store }
    }
}

impl UdnLister for StoreUdnLister {
    fn list(&self, namespace: &str) -> Result<Vec<Arc<UserDefinedNetwork>>> {
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|udn| udn.namespace().as_deref() == Some(namespace))
            .collect())
    }
}
