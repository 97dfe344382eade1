use anyhow::{Context, Result};
use kube::{Api, Client};
use kube_runtime::reflector;
use netplane_api::{NetworkAttachmentDefinition, UserDefinedNetwork};
use netplane_core::context::CancelableContext;
use netplane_core::metrics::ReconcilerMetrics;
use netplane_core::registry::NetworkEvent;
use netplane_core::{NadController, NadControllerKind, NetworkRegistry};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod events;
mod http;
mod listers;
mod runtime;

use config::{ControllerConfig, LogFormat};
use events::KubeEventRecorder;
use listers::{StoreNadLister, StoreUdnLister};
use runtime::{KeyQueue, RetryPolicy};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::from_env()?;
    init_tracing(config.log_format);

    info!(
        "Starting netplane-controller ({} mode, network segmentation {})",
        config.kind,
        if config.network_segmentation { "enabled" } else { "disabled" }
    );

    let client = Client::try_default().await?;
    let metrics = ReconcilerMetrics::new()?;
    let ctx = CancelableContext::new();
    let (queue, requests) = KeyQueue::new();

    // Attachment definition cache, feeding the key scheduler
    let (nad_store, nad_writer) = reflector::store::<NetworkAttachmentDefinition>();
    tokio::spawn(runtime::watch_nads(
        Api::all(client.clone()),
        nad_writer,
        nad_store.clone(),
        queue.clone(),
        ctx.child(),
    ));

    let registry = NetworkRegistry::new();
    tokio::spawn(log_network_events(registry.subscribe(), ctx.child()));

    let mut controller = NadController::new(
        &config.controller_name,
        config.kind.clone(),
        Arc::new(registry),
        Arc::new(StoreNadLister::new(nad_store.clone())),
    )
    .with_network_segmentation(config.network_segmentation)
    .with_metrics(metrics.clone());

    if config.network_segmentation {
        let (udn_store, udn_writer) = reflector::store::<UserDefinedNetwork>();
        tokio::spawn(runtime::watch_udns(
            Api::all(client.clone()),
            udn_writer,
            ctx.child(),
        ));
        controller = controller.with_udn_lister(Arc::new(StoreUdnLister::new(udn_store)));
    }

    if config.kind == NadControllerKind::Cluster {
        controller = controller.with_recorder(Arc::new(KubeEventRecorder::new(
            client.clone(),
            &config.controller_name,
        )));
    }
    let controller = Arc::new(controller);

    let http_ctx = ctx.child();
    let metrics_addr = config.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = http::serve(metrics_addr, metrics, http_ctx).await {
            error!("Metrics server error: {}", e);
        }
    });

    nad_store
        .wait_until_ready()
        .await
        .context("NetworkAttachmentDefinition cache never became ready")?;
    info!("{}: cache synced, starting initial sync", controller.name());
    controller.sync_all().await?;

    let worker = tokio::spawn(runtime::run_worker(
        controller.clone(),
        queue,
        requests,
        RetryPolicy::new(config.retry_base, config.retry_max),
        ctx.child(),
    ));
    info!("{}: started", controller.name());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");
    ctx.cancel();
    if let Err(e) = worker.await {
        warn!("Worker task failed: {}", e);
    }

    Ok(())
}

async fn log_network_events(mut events: broadcast::Receiver<NetworkEvent>, ctx: CancelableContext) {
    loop {
        let event = tokio::select! {
            _ = ctx.done() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(NetworkEvent::Ensured(network)) => {
                info!("Network {} ensured ({:?})", network.name(), network.nads())
            }
            Ok(NetworkEvent::Deleted(name)) => info!("Network {} deleted", name),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Network event log lagged, skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
