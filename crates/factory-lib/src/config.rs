//! Factory configuration
//!
//! `FactoryConfig` is the raw, deserialisable form of the settings. It is
//! validated once into an immutable [`ConfigSnapshot`]; a reload builds a new
//! snapshot and swaps it into the [`ConfigHandle`] as a whole.

use crate::error::{FactoryError, Result};
use crate::models::{slot_hostname, BackendModel};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Fixed private prefix for NAT addressing
pub const DEFAULT_NAT_PREFIX: &str = "169.254.169.";

/// Raw factory settings
#[derive(Debug, Clone, Deserialize)]
pub struct FactoryConfig {
    /// Fully qualified factory name, defaults to the host name
    #[serde(default)]
    pub factory_name: Option<String>,

    /// Space of cooperating factories
    pub space: String,

    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    pub total_processors: u32,

    /// Number of slots, defaults to one per processor
    #[serde(default)]
    pub num_slots: Option<usize>,

    #[serde(default = "default_mb_per_processor")]
    pub mb_per_processor: u64,

    /// Fixed logical volume size per processor; fair share when absent
    #[serde(default)]
    pub gb_per_processor: Option<u64>,

    /// Volume group for logical volumes; copy-on-write images when absent
    #[serde(default)]
    pub volume_group: Option<String>,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Identity Singularity instances run as
    #[serde(default)]
    pub managed_uid: Option<u32>,
    #[serde(default)]
    pub managed_gid: Option<u32>,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_query_port")]
    pub query_port: u16,

    /// Retention for machine directories of unknown instance types
    #[serde(default = "default_retention_secs")]
    pub default_retention_secs: i64,

    /// Hosts file carrying NAT entries, `<base_dir>/hosts` when absent
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,

    #[serde(default)]
    pub machinetypes: BTreeMap<String, MachineTypeSettings>,
}

/// Network settings as written in the configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum NetworkSettings {
    Nat {
        #[serde(default = "default_nat_prefix")]
        prefix: String,
    },
    Bridge {
        #[serde(default = "default_bridge_device")]
        device: String,
    },
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings::Nat {
            prefix: default_nat_prefix(),
        }
    }
}

/// Raw instance type settings
#[derive(Debug, Clone, Deserialize)]
pub struct MachineTypeSettings {
    pub backend_model: String,
    pub root_image: String,
    #[serde(default = "default_one")]
    pub min_processors: u32,
    #[serde(default = "default_one")]
    pub max_processors: u32,
    #[serde(default = "default_max_wallclock")]
    pub max_wallclock_seconds: i64,
    #[serde(default = "default_fizzle")]
    pub fizzle_seconds: i64,
    #[serde(default = "default_backoff")]
    pub backoff_seconds: i64,
    #[serde(default)]
    pub heartbeat_file: Option<String>,
    #[serde(default)]
    pub heartbeat_seconds: i64,
    #[serde(default = "default_target_share")]
    pub target_share: f64,
    #[serde(default = "default_machinetype_retention")]
    pub retention_secs: i64,
    #[serde(default)]
    pub accounting_fqan: Option<String>,
    #[serde(default = "default_container_command")]
    pub container_command: String,
    #[serde(default)]
    pub hs06_per_processor: Option<f64>,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/factoryd")
}

fn default_mb_per_processor() -> u64 {
    2048
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_query_port() -> u16 {
    995
}

fn default_retention_secs() -> i64 {
    3600
}

fn default_nat_prefix() -> String {
    DEFAULT_NAT_PREFIX.to_string()
}

fn default_bridge_device() -> String {
    "br0".to_string()
}

fn default_one() -> u32 {
    1
}

fn default_max_wallclock() -> i64 {
    86400
}

fn default_fizzle() -> i64 {
    600
}

fn default_backoff() -> i64 {
    10
}

fn default_target_share() -> f64 {
    1.0
}

fn default_machinetype_retention() -> i64 {
    3 * 86400
}

fn default_container_command() -> String {
    "/bin/sh /user_data".to_string()
}

/// Validated network mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    /// Deterministic private address per ordinal
    Nat { prefix: [u8; 3] },
    /// Bridged onto a host device, addressing left to DHCP
    Bridge { device: String },
}

/// Immutable instance type definition
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceType {
    pub name: String,
    pub model: BackendModel,
    pub root_image: String,
    pub min_processors: u32,
    pub max_processors: u32,
    pub max_wallclock_seconds: i64,
    pub fizzle_seconds: i64,
    pub backoff_seconds: i64,
    pub heartbeat_file: Option<String>,
    pub heartbeat_seconds: i64,
    pub target_share: f64,
    pub retention_secs: i64,
    pub accounting_fqan: Option<String>,
    pub container_command: String,
    pub hs06_per_processor: Option<f64>,
}

impl InstanceType {
    fn from_settings(name: &str, settings: &MachineTypeSettings) -> Result<Self> {
        let model: BackendModel = settings
            .backend_model
            .parse()
            .map_err(|e: String| FactoryError::Config(format!("machinetype {}: {}", name, e)))?;

        if settings.min_processors == 0 || settings.min_processors > settings.max_processors {
            return Err(FactoryError::Config(format!(
                "machinetype {}: invalid processor bounds {}..{}",
                name, settings.min_processors, settings.max_processors
            )));
        }

        if settings.target_share < 0.0 || !settings.target_share.is_finite() {
            return Err(FactoryError::Config(format!(
                "machinetype {}: target_share must be a non-negative number",
                name
            )));
        }

        if settings.root_image.trim().is_empty() {
            return Err(FactoryError::Config(format!(
                "machinetype {}: root_image is required",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            model,
            root_image: settings.root_image.clone(),
            min_processors: settings.min_processors,
            max_processors: settings.max_processors,
            max_wallclock_seconds: settings.max_wallclock_seconds,
            fizzle_seconds: settings.fizzle_seconds,
            backoff_seconds: settings.backoff_seconds,
            heartbeat_file: settings.heartbeat_file.clone(),
            heartbeat_seconds: settings.heartbeat_seconds,
            target_share: settings.target_share,
            retention_secs: settings.retention_secs,
            accounting_fqan: settings.accounting_fqan.clone(),
            container_command: settings.container_command.clone(),
            hs06_per_processor: settings.hs06_per_processor,
        })
    }
}

/// Validated, read-only configuration
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub factory_name: String,
    pub space: String,
    pub base_dir: PathBuf,
    pub total_processors: u32,
    pub num_slots: usize,
    pub mb_per_processor: u64,
    pub gb_per_processor: Option<u64>,
    pub volume_group: Option<String>,
    pub network: NetworkMode,
    pub cgroup_root: PathBuf,
    pub proc_root: PathBuf,
    pub managed_uid: Option<u32>,
    pub managed_gid: Option<u32>,
    pub shutdown_grace: Duration,
    pub query_port: u16,
    pub default_retention_secs: i64,
    pub hosts_file: PathBuf,
    pub machinetypes: BTreeMap<String, InstanceType>,
}

impl ConfigSnapshot {
    /// Validate raw settings into a snapshot
    pub fn from_config(config: &FactoryConfig) -> Result<Self> {
        if config.space.trim().is_empty() {
            return Err(FactoryError::Config("space must not be empty".into()));
        }
        if config.total_processors == 0 {
            return Err(FactoryError::Config(
                "total_processors must be greater than zero".into(),
            ));
        }

        let num_slots = config
            .num_slots
            .unwrap_or(config.total_processors as usize);
        if num_slots == 0 || num_slots > 100 {
            return Err(FactoryError::Config(format!(
                "num_slots must be between 1 and 100, got {}",
                num_slots
            )));
        }

        let factory_name = match &config.factory_name {
            Some(name) => name.clone(),
            None => nix::unistd::gethostname()
                .map_err(|e| FactoryError::Config(format!("cannot determine host name: {}", e)))?
                .to_string_lossy()
                .to_string(),
        };

        let network = match &config.network {
            NetworkSettings::Nat { prefix } => NetworkMode::Nat {
                prefix: parse_nat_prefix(prefix)?,
            },
            NetworkSettings::Bridge { device } => NetworkMode::Bridge {
                device: device.clone(),
            },
        };

        let mut machinetypes = BTreeMap::new();
        for (name, settings) in &config.machinetypes {
            let machinetype = InstanceType::from_settings(name, settings)?;
            if machinetype.max_processors > config.total_processors {
                return Err(FactoryError::Config(format!(
                    "machinetype {}: max_processors {} exceeds total_processors {}",
                    name, machinetype.max_processors, config.total_processors
                )));
            }
            machinetypes.insert(name.clone(), machinetype);
        }

        let hosts_file = config
            .hosts_file
            .clone()
            .unwrap_or_else(|| config.base_dir.join("hosts"));

        Ok(Self {
            factory_name,
            space: config.space.clone(),
            base_dir: config.base_dir.clone(),
            total_processors: config.total_processors,
            num_slots,
            mb_per_processor: config.mb_per_processor,
            gb_per_processor: config.gb_per_processor,
            volume_group: config.volume_group.clone(),
            network,
            cgroup_root: config.cgroup_root.clone(),
            proc_root: config.proc_root.clone(),
            managed_uid: config.managed_uid,
            managed_gid: config.managed_gid,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            query_port: config.query_port,
            default_retention_secs: config.default_retention_secs,
            hosts_file,
            machinetypes,
        })
    }

    /// Resolve an instance type by name
    pub fn machinetype(&self, name: &str) -> Result<&InstanceType> {
        self.machinetypes
            .get(name)
            .ok_or_else(|| FactoryError::Config(format!("unknown machinetype {}", name)))
    }

    pub fn hostname(&self, ordinal: usize) -> String {
        slot_hostname(&self.factory_name, ordinal)
    }

    /// Hostnames of every slot, indexed by ordinal
    pub fn hostnames(&self) -> Vec<String> {
        (0..self.num_slots).map(|n| self.hostname(n)).collect()
    }

    /// Ordinal of a hostname belonging to this factory
    pub fn ordinal_of(&self, hostname: &str) -> Option<usize> {
        (0..self.num_slots).find(|n| self.hostname(*n) == hostname)
    }

    /// Retention window for a machine directory of the given type
    pub fn retention_secs(&self, machinetype: &str) -> i64 {
        self.machinetypes
            .get(machinetype)
            .map(|m| m.retention_secs)
            .unwrap_or(self.default_retention_secs)
    }
}

fn parse_nat_prefix(prefix: &str) -> Result<[u8; 3]> {
    let octets: Vec<&str> = prefix.trim_end_matches('.').split('.').collect();
    if octets.len() != 3 {
        return Err(FactoryError::Config(format!(
            "NAT prefix {:?} must have three octets",
            prefix
        )));
    }

    let mut parsed = [0u8; 3];
    for (slot, octet) in parsed.iter_mut().zip(octets) {
        *slot = octet
            .parse()
            .map_err(|_| FactoryError::Config(format!("invalid NAT prefix {:?}", prefix)))?;
    }
    Ok(parsed)
}

/// Shared handle to the current snapshot
///
/// Readers take an `Arc` to the snapshot at the start of an operation and use
/// it throughout, so a concurrent reload never changes settings mid-operation.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<ConfigSnapshot>>>,
}

impl ConfigHandle {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub async fn current(&self) -> Arc<ConfigSnapshot> {
        self.inner.read().await.clone()
    }

    /// Swap in a freshly loaded snapshot
    pub async fn replace(&self, snapshot: ConfigSnapshot) {
        let mut guard = self.inner.write().await;
        *guard = Arc::new(snapshot);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::Path;

    pub fn machinetype_settings(model: &str) -> MachineTypeSettings {
        MachineTypeSettings {
            backend_model: model.to_string(),
            root_image: "/var/lib/images/root.img".to_string(),
            min_processors: 1,
            max_processors: 1,
            max_wallclock_seconds: 86400,
            fizzle_seconds: 600,
            backoff_seconds: 10,
            heartbeat_file: None,
            heartbeat_seconds: 0,
            target_share: 1.0,
            retention_secs: 86400,
            accounting_fqan: None,
            container_command: "/bin/sh /user_data".to_string(),
            hs06_per_processor: Some(10.0),
        }
    }

    /// Snapshot rooted in a test directory with one `batch` type per model
    pub fn snapshot(base_dir: &Path, model: &str) -> ConfigSnapshot {
        let mut machinetypes = BTreeMap::new();
        machinetypes.insert("batch".to_string(), machinetype_settings(model));
        let config = FactoryConfig {
            factory_name: Some("host.example.com".to_string()),
            space: "space.example.com".to_string(),
            base_dir: base_dir.to_path_buf(),
            total_processors: 4,
            num_slots: None,
            mb_per_processor: 2048,
            gb_per_processor: None,
            volume_group: None,
            network: NetworkSettings::default(),
            cgroup_root: base_dir.join("cgroup"),
            proc_root: base_dir.join("proc"),
            managed_uid: Some(1500),
            managed_gid: Some(1500),
            shutdown_grace_secs: 0,
            query_port: 995,
            default_retention_secs: 3600,
            hosts_file: None,
            machinetypes,
        };
        ConfigSnapshot::from_config(&config).unwrap()
    }
}
