//! Data models shared across the factory core

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

/// Execution technology recorded for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendModel {
    #[serde(rename = "vm-raw")]
    VmRaw,
    #[serde(rename = "cernvm3")]
    CernVm3,
    #[serde(rename = "docker")]
    Docker,
    #[serde(rename = "singularity")]
    Singularity,
}

impl BackendModel {
    pub const ALL: [BackendModel; 4] = [
        BackendModel::VmRaw,
        BackendModel::CernVm3,
        BackendModel::Docker,
        BackendModel::Singularity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VmRaw => "vm-raw",
            Self::CernVm3 => "cernvm3",
            Self::Docker => "docker",
            Self::Singularity => "singularity",
        }
    }

    /// Which driver family realises this model
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::VmRaw | Self::CernVm3 => BackendKind::Vm,
            Self::Docker => BackendKind::DockerContainer,
            Self::Singularity => BackendKind::SingularityContainer,
        }
    }
}

impl fmt::Display for BackendModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown backend model {:?}", s))
    }
}

/// Backend driver family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Vm,
    DockerContainer,
    SingularityContainer,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vm => "vm",
            Self::DockerContainer => "docker",
            Self::SingularityContainer => "singularity",
        };
        f.write_str(name)
    }
}

/// Slot lifecycle state derived from on-disk markers and backend liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Unknown,
    Starting,
    Running,
    Paused,
    Shutdown,
    /// Orphaned backend instance found by the reaper; never derived for a
    /// slot, only counted per sweep and accepted from peers
    Zombie,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Zombie => "zombie",
        }
    }

    /// Slot may take a new instance
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Unknown | Self::Shutdown)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of `slots/<hostname>`: `<created> <machinetype> <model>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    pub created: i64,
    pub machinetype: String,
    pub model: BackendModel,
}

impl SlotRecord {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let created = parts.next()?.parse().ok()?;
        let machinetype = parts.next()?.to_string();
        let model = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            created,
            machinetype,
            model,
        })
    }

    pub fn to_line(&self) -> String {
        format!("{} {} {}\n", self.created, self.machinetype, self.model)
    }

    /// Directory name under `machines/` for this instance
    pub fn machine_dir_name(&self, hostname: &str) -> String {
        format!("{}_{}_{}", self.created, self.machinetype, hostname)
    }
}

/// Hostname of slot `ordinal` on factory `factory_name`
///
/// `vac01.example.com` gives `vac01-03.example.com` for ordinal 3.
pub fn slot_hostname(factory_name: &str, ordinal: usize) -> String {
    match factory_name.split_once('.') {
        Some((short, domain)) => format!("{}-{:02}.{}", short, ordinal, domain),
        None => format!("{}-{:02}", factory_name, ordinal),
    }
}

/// Inverse of [`slot_hostname`], for any ordinal
pub fn slot_ordinal(factory_name: &str, hostname: &str) -> Option<usize> {
    let (short, rest) = match factory_name.split_once('.') {
        Some((short, domain)) => (short, hostname.strip_suffix(domain)?.strip_suffix('.')?),
        None => (factory_name, hostname),
    };
    let digits = rest.strip_prefix(short)?.strip_prefix('-')?;
    if digits.len() < 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let ordinal = digits.parse().ok()?;
    (slot_hostname(factory_name, ordinal) == hostname).then_some(ordinal)
}

/// Reason recorded when an instance shuts down: `<code> <text>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownMessage {
    pub code: u16,
    pub text: String,
}

impl ShutdownMessage {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (code, text) = line.split_once(' ').unwrap_or((line, ""));
        Some(Self {
            code: code.parse().ok()?,
            text: text.trim().to_string(),
        })
    }

    /// Success or "nothing to do" outcomes do not trigger backoff
    pub fn is_normal(&self) -> bool {
        self.code == 200 || self.code == 300
    }
}

impl fmt::Display for ShutdownMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Cgroup directories held by one container-process instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupPair {
    pub cpu: PathBuf,
    pub memory: PathBuf,
}

/// Network identity of a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Only set when NAT networking is used
    pub ip: Option<Ipv4Addr>,
    pub mac: String,
}

/// Physical resources a slot currently holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAllocation {
    pub volume: Option<PathBuf>,
    pub volume_bytes: Option<u64>,
    pub cgroups: Option<CgroupPair>,
    pub network: NetworkAddress,
    pub root_disk: Option<PathBuf>,
}

/// Point-in-time view of one logical machine slot
#[derive(Debug, Clone, Serialize)]
pub struct LogicalMachine {
    pub ordinal: usize,
    pub hostname: String,
    pub state: MachineState,
    pub model: Option<BackendModel>,
    pub machinetype: Option<String>,
    pub created: Option<i64>,
    pub started: Option<i64>,
    pub finished: Option<i64>,
    pub heartbeat: Option<i64>,
    pub uuid: Option<String>,
    pub processors: u32,
    pub memory_mb: u64,
    pub cpu_seconds: u64,
    pub cpu_percentage: f64,
    pub ip: Option<Ipv4Addr>,
    pub shutdown_deadline: Option<i64>,
    pub shutdown_message: Option<ShutdownMessage>,
    pub shutdown_time: Option<i64>,
    #[serde(skip)]
    pub machine_dir: Option<PathBuf>,
}

impl LogicalMachine {
    /// An empty slot with no record
    pub fn unknown(ordinal: usize, hostname: impl Into<String>) -> Self {
        Self {
            ordinal,
            hostname: hostname.into(),
            state: MachineState::Unknown,
            model: None,
            machinetype: None,
            created: None,
            started: None,
            finished: None,
            heartbeat: None,
            uuid: None,
            processors: 0,
            memory_mb: 0,
            cpu_seconds: 0,
            cpu_percentage: 0.0,
            ip: None,
            shutdown_deadline: None,
            shutdown_message: None,
            shutdown_time: None,
            machine_dir: None,
        }
    }
}
