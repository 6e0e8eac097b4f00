use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hydromaas_id::ResourceId;
use serde::Deserialize;

use crate::db::DbConfig;
use crate::jobs::QueuePolicy;
use crate::resources::{AssetGrouping, Resource};

/// Which backend holds the shared records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    /// Process-local; only for development, since nothing is shared.
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "pg" => Ok(StoreKind::Postgres),
            "memory" | "mem" => Ok(StoreKind::Memory),
            other => Err(format!("unknown store '{other}'")),
        }
    }
}

/// Control loop settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Prefix for every store key, so several deployments can share a store.
    pub key_prefix: String,
    /// Name of the resource pool this scheduler allocates from.
    pub resource_pool: String,
    /// Pause between control loop ticks.
    pub tick_interval: Duration,
    /// Pause between attempts to take the active jobs lock.
    pub lock_retry: Duration,
    /// How long a held lock stays valid without being released.
    pub lock_lease: Duration,
    pub asset_grouping: AssetGrouping,
    pub queue_policy: QueuePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            key_prefix: "maas".to_string(),
            resource_pool: "default".to_string(),
            tick_interval: Duration::from_secs(5),
            lock_retry: Duration::from_secs(2),
            lock_lease: Duration::from_secs(60),
            asset_grouping: AssetGrouping::Bundle,
            queue_policy: QueuePolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub store: StoreKind,
    pub database: DbConfig,
    /// JSON list of nodes registered at startup.
    pub fleet_file: Option<PathBuf>,
    /// Base URL of the launch service; the mock launcher is used when unset.
    pub launcher_url: Option<String>,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration through a variable lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("HYDROMAAS_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid HYDROMAAS_LISTEN_ADDR")?;

        let log_level = lookup("HYDROMAAS_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("HYDROMAAS_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let store = match lookup("HYDROMAAS_STORE") {
            Some(v) => v.parse().map_err(|e: String| anyhow!(e))?,
            None => StoreKind::Postgres,
        };

        let defaults = SchedulerConfig::default();
        let secs = |name: &str, default: Duration| -> Result<Duration> {
            match lookup(name) {
                Some(v) => {
                    let n: u64 = v.trim().parse().with_context(|| format!("invalid {name}"))?;
                    Ok(Duration::from_secs(n))
                }
                None => Ok(default),
            }
        };

        let asset_grouping = match lookup("HYDROMAAS_ASSET_GROUPING") {
            Some(v) => v.parse().map_err(|e: String| anyhow!(e))?,
            None => defaults.asset_grouping,
        };

        let queue_policy = QueuePolicy {
            starvation_after: secs(
                "HYDROMAAS_STARVATION_SECS",
                defaults.queue_policy.starvation_after,
            )?,
            ..defaults.queue_policy.clone()
        };

        let scheduler = SchedulerConfig {
            key_prefix: lookup("HYDROMAAS_KEY_PREFIX").unwrap_or(defaults.key_prefix.clone()),
            resource_pool: lookup("HYDROMAAS_RESOURCE_POOL")
                .unwrap_or(defaults.resource_pool.clone()),
            tick_interval: secs("HYDROMAAS_TICK_SECS", defaults.tick_interval)?,
            lock_retry: secs("HYDROMAAS_LOCK_RETRY_SECS", defaults.lock_retry)?,
            lock_lease: secs("HYDROMAAS_LOCK_LEASE_SECS", defaults.lock_lease)?,
            asset_grouping,
            queue_policy,
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            store,
            database: DbConfig::from_lookup(&lookup),
            fleet_file: lookup("HYDROMAAS_FLEET_FILE").map(PathBuf::from),
            launcher_url: lookup("HYDROMAAS_LAUNCHER_URL").filter(|s| !s.trim().is_empty()),
            scheduler,
        })
    }
}

/// One node in a fleet file.
#[derive(Debug, Deserialize)]
struct FleetEntry {
    resource_id: String,
    hostname: String,
    cpus: u32,
    memory: u64,
}

/// Parse a fleet description: a JSON array of
/// `{"resource_id", "hostname", "cpus", "memory"}` objects.
pub fn parse_fleet(json: &str) -> Result<Vec<Resource>> {
    let entries: Vec<FleetEntry> = serde_json::from_str(json).context("invalid fleet file")?;
    entries
        .into_iter()
        .map(|e| {
            let id = ResourceId::parse(&e.resource_id)
                .with_context(|| format!("invalid resource id '{}'", e.resource_id))?;
            Ok(Resource::new(id, e.hostname, e.cpus, e.memory))
        })
        .collect()
}

pub fn load_fleet(path: &Path) -> Result<Vec<Resource>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fleet file {}", path.display()))?;
    parse_fleet(&json)
}
