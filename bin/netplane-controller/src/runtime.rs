//! Watch loop and key scheduling driving the NAD controller
//!
//! Watch events are reduced to keys and handed to a `kube_runtime`
//! scheduler feeding a single worker. The scheduler holds each key at most
//! once, keeping its earliest due time. Keys that fail with a retryable
//! error are scheduled again after a per-key exponential delay, which is
//! reset when the key syncs successfully.

use futures::channel::mpsc;
use futures::StreamExt;
use kube::Api;
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::scheduler::{scheduler, ScheduleRequest};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use netplane_api::{NetworkAttachmentDefinition, UserDefinedNetwork};
use netplane_core::context::CancelableContext;
use netplane_core::keys::meta_namespace_key;
use netplane_core::{nad_needs_update, CoreError, NadController};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Requests for the key scheduler
pub type KeyRequests = mpsc::UnboundedReceiver<ScheduleRequest<String>>;

/// Sending half of the key scheduler
#[derive(Clone)]
pub struct KeyQueue {
    tx: mpsc::UnboundedSender<ScheduleRequest<String>>,
}

impl KeyQueue {
    pub fn new() -> (Self, KeyRequests) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx)
    }

    pub fn add(&self, key: String) {
        self.add_after(key, Duration::ZERO);
    }

    /// Schedule `key` no earlier than `delay` from now. A key already
    /// scheduled keeps the earlier of the two times.
    pub fn add_after(&self, key: String, delay: Duration) {
        let request = ScheduleRequest {
            message: key,
            run_at: Instant::now() + delay,
        };
        if let Err(e) = self.tx.unbounded_send(request) {
            debug!("Key queue closed, dropping {}", e.into_inner().message);
        }
    }
}

/// Per-key retry delays: `base * 2^(failures-1)`, capped at `max`
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Delay before `key` is synced again, `None` when retrying cannot help
    pub fn on_error(&mut self, key: &str, error: &CoreError) -> Option<Duration> {
        if !error.is_retryable() {
            self.failures.remove(key);
            return None;
        }
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        *failures = failures.saturating_add(1);
        let failures = *failures;
        Some(self.delay(failures))
    }

    pub fn on_success(&mut self, key: &str) {
        self.failures.remove(key);
    }

    fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Sync scheduled keys one at a time until the context is cancelled
pub async fn run_worker(
    controller: Arc<NadController>,
    queue: KeyQueue,
    requests: KeyRequests,
    mut retries: RetryPolicy,
    ctx: CancelableContext,
) {
    let shutdown = ctx.clone();
    let keys = scheduler(requests).take_until(async move { shutdown.done().await });
    futures::pin_mut!(keys);

    while let Some(key) = keys.next().await {
        match controller.sync(&key).await {
            Ok(()) => retries.on_success(&key),
            Err(e) => match retries.on_error(&key, &e) {
                Some(delay) => {
                    warn!(
                        "{}: failed to sync {}, retrying in {:?}: {}",
                        controller.name(),
                        key,
                        delay,
                        e
                    );
                    queue.add_after(key, delay);
                }
                None => error!("{}: dropping {} after error: {}", controller.name(), key, e),
            },
        }
    }

    info!("{}: worker stopped", controller.name());
}

/// Reduces NAD watch events to the keys that need a sync.
///
/// The initial listing is left to the controller's full sync. Later
/// relists queue every changed object and every object that disappeared
/// while the watch was down.
#[derive(Default)]
pub struct NadEventFilter {
    synced: bool,
    before_relist: HashSet<String>,
    seen: HashSet<String>,
}

impl NadEventFilter {
    /// Must be called before `event` is applied to the store
    pub fn keys_to_sync(
        &mut self,
        store: &Store<NetworkAttachmentDefinition>,
        event: &Event<NetworkAttachmentDefinition>,
    ) -> Vec<String> {
        match event {
            Event::Apply(nad) => changed(store, nad).into_iter().collect(),
            Event::Delete(nad) => meta_namespace_key(nad).ok().into_iter().collect(),
            Event::Init => {
                self.seen.clear();
                self.before_relist = store
                    .state()
                    .iter()
                    .filter_map(|nad| meta_namespace_key(&**nad).ok())
                    .collect();
                vec![]
            }
            Event::InitApply(nad) => {
                if let Ok(key) = meta_namespace_key(nad) {
                    self.seen.insert(key);
                }
                if !self.synced {
                    return vec![];
                }
                changed(store, nad).into_iter().collect()
            }
            Event::InitDone => {
                let relist = self.synced;
                self.synced = true;
                if !relist {
                    return vec![];
                }
                let mut gone: Vec<String> =
                    self.before_relist.difference(&self.seen).cloned().collect();
                gone.sort();
                self.before_relist.clear();
                self.seen.clear();
                gone
            }
        }
    }
}

fn changed(
    store: &Store<NetworkAttachmentDefinition>,
    nad: &NetworkAttachmentDefinition,
) -> Option<String> {
    let old = store.get(&ObjectRef::from_obj(nad));
    if !nad_needs_update(old.as_deref(), Some(nad)) {
        return None;
    }
    meta_namespace_key(nad).ok()
}

/// Watch NADs into `writer`, queueing keys that need a sync
pub async fn watch_nads(
    api: Api<NetworkAttachmentDefinition>,
    mut writer: Writer<NetworkAttachmentDefinition>,
    store: Store<NetworkAttachmentDefinition>,
    queue: KeyQueue,
    ctx: CancelableContext,
) {
    let mut filter = NadEventFilter::default();
    let stream = watch_stream(api);
    futures::pin_mut!(stream);

    loop {
        let event = tokio::select! {
            _ = ctx.done() => break,
            event = stream.next() => event,
        };
        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!("NetworkAttachmentDefinition watch error: {}", e);
                continue;
            }
            None => break,
        };

        let keys = filter.keys_to_sync(&store, &event);
        writer.apply_watcher_event(&event);
        for key in keys {
            debug!("Queueing NetworkAttachmentDefinition {}", key);
            queue.add(key);
        }
    }

    info!("NetworkAttachmentDefinition watch stopped");
}

/// Keep `writer` in sync with the cluster's UDNs
pub async fn watch_udns(
    api: Api<UserDefinedNetwork>,
    writer: Writer<UserDefinedNetwork>,
    ctx: CancelableContext,
) {
    let stream = watch_stream(api).reflect(writer);
    futures::pin_mut!(stream);

    loop {
        tokio::select! {
            _ = ctx.done() => break,
            event = stream.next() => match event {
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!("UserDefinedNetwork watch error: {}", e),
                None => break,
            },
        }
    }

    info!("UserDefinedNetwork watch stopped");
}

fn watch_stream<K>(api: Api<K>) -> impl futures::Stream<Item = watcher::Result<Event<K>>>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default()).default_backoff()
}
