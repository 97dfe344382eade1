//! Controller configuration from environment variables

use anyhow::{anyhow, bail, Context, Result};
use netplane_core::NadControllerKind;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_CONTROLLER_NAME: &str = "cluster-manager";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9410";
const DEFAULT_RETRY_BASE_MS: u64 = 5;
const DEFAULT_RETRY_MAX_SECS: u64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub controller_name: String,
    pub kind: NadControllerKind,
    pub network_segmentation: bool,
    pub metrics_addr: SocketAddr,
    pub log_format: LogFormat,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let controller_name =
            get("NETPLANE_CONTROLLER_NAME").unwrap_or_else(|| DEFAULT_CONTROLLER_NAME.to_string());

        let mode = get("NETPLANE_MODE").unwrap_or_else(|| "cluster".to_string());
        let kind = match mode.as_str() {
            "cluster" => NadControllerKind::Cluster,
            "zone" => NadControllerKind::Zone(
                get("NETPLANE_ZONE").ok_or_else(|| anyhow!("NETPLANE_ZONE is required in zone mode"))?,
            ),
            "node" => NadControllerKind::Node(
                get("NETPLANE_NODE")
                    .ok_or_else(|| anyhow!("NETPLANE_NODE is required in node mode"))?,
            ),
            other => bail!("unknown NETPLANE_MODE {:?}, expected cluster, zone or node", other),
        };

        let network_segmentation = match get("NETPLANE_NETWORK_SEGMENTATION") {
            Some(v) => parse_bool(&v).context("NETPLANE_NETWORK_SEGMENTATION")?,
            None => true,
        };

        let metrics_addr = get("NETPLANE_METRICS_ADDR")
            .unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string())
            .parse()
            .context("NETPLANE_METRICS_ADDR")?;

        let log_format = match get("NETPLANE_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("unknown NETPLANE_LOG_FORMAT {:?}", other),
        };

        let retry_base_ms = match get("NETPLANE_RETRY_BASE_MS") {
            Some(v) => v.parse().context("NETPLANE_RETRY_BASE_MS")?,
            None => DEFAULT_RETRY_BASE_MS,
        };
        let retry_max_secs = match get("NETPLANE_RETRY_MAX_SECS") {
            Some(v) => v.parse().context("NETPLANE_RETRY_MAX_SECS")?,
            None => DEFAULT_RETRY_MAX_SECS,
        };
        if retry_base_ms == 0 {
            bail!("NETPLANE_RETRY_BASE_MS must be positive");
        }

        Ok(Self {
            controller_name,
            kind,
            network_segmentation,
            metrics_addr,
            log_format,
            retry_base: Duration::from_millis(retry_base_ms),
            retry_max: Duration::from_secs(retry_max_secs),
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("invalid boolean {:?}", other),
    }
}
