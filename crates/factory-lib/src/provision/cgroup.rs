//! Per-instance cgroups for container processes
//!
//! Each Singularity instance gets a CPU and a memory cgroup named after its
//! slot hostname under the `vac/` subtree:
//! - cgroup v1: `<root>/cpu/vac/<name>` and `<root>/memory/vac/<name>`
//! - cgroup v2: `<root>/vac/<name>` holding both controllers

use crate::error::{FactoryError, Result};
use crate::models::CgroupPair;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Subtree holding every managed cgroup
pub const SUBTREE: &str = "vac";

const CPU_SHARES_PER_PROCESSOR: u64 = 1024;
const CPU_WEIGHT_PER_PROCESSOR: u64 = 100;

/// Cgroup version detected on the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
    Unknown,
}

/// Detect which cgroup version is mounted at `cgroup_root`
pub async fn detect_cgroup_version(cgroup_root: &Path) -> CgroupVersion {
    if fs::metadata(cgroup_root.join("cgroup.controllers"))
        .await
        .is_ok()
    {
        return CgroupVersion::V2;
    }

    let v1_memory = cgroup_root.join("memory");
    let v1_cpuacct = cgroup_root.join("cpuacct");
    if fs::metadata(&v1_memory).await.is_ok() && fs::metadata(&v1_cpuacct).await.is_ok() {
        return CgroupVersion::V1;
    }

    CgroupVersion::Unknown
}

/// Extract `usage_usec` from a cgroup v2 `cpu.stat`
pub fn parse_cpu_stat(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("usage_usec"), Some(value)) => value.parse().ok(),
            _ => None,
        }
    })
}

/// Parse a `cgroup.procs` listing
pub fn parse_procs(content: &str) -> Vec<u32> {
    content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Creates, inspects and prunes the managed cgroups
#[derive(Debug, Clone)]
pub struct CgroupManager {
    root: PathBuf,
    version: CgroupVersion,
}

impl CgroupManager {
    pub fn new(root: impl Into<PathBuf>, version: CgroupVersion) -> Self {
        Self {
            root: root.into(),
            version,
        }
    }

    /// Build a manager for whatever hierarchy is mounted at `root`
    pub async fn detect(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let version = match detect_cgroup_version(&root).await {
            CgroupVersion::Unknown => {
                warn!(root = %root.display(), "Could not detect cgroup version, defaulting to v2");
                CgroupVersion::V2
            }
            version => {
                info!(root = %root.display(), version = ?version, "Detected cgroup hierarchy");
                version
            }
        };
        Self { root, version }
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn subtrees(&self) -> Vec<PathBuf> {
        match self.version {
            CgroupVersion::V1 => vec![
                self.root.join("cpu").join(SUBTREE),
                self.root.join("memory").join(SUBTREE),
            ],
            _ => vec![self.root.join(SUBTREE)],
        }
    }

    /// Paths of the cgroups for instance `name`
    pub fn pair(&self, name: &str) -> CgroupPair {
        match self.version {
            CgroupVersion::V1 => CgroupPair {
                cpu: self.root.join("cpu").join(SUBTREE).join(name),
                memory: self.root.join("memory").join(SUBTREE).join(name),
            },
            _ => {
                let path = self.root.join(SUBTREE).join(name);
                CgroupPair {
                    cpu: path.clone(),
                    memory: path,
                }
            }
        }
    }

    fn dirs(&self, name: &str) -> Vec<PathBuf> {
        let pair = self.pair(name);
        if pair.cpu == pair.memory {
            vec![pair.cpu]
        } else {
            vec![pair.cpu, pair.memory]
        }
    }

    /// Create fresh cgroups for `name`, tearing down any stale ones first
    pub async fn create(
        &self,
        name: &str,
        processors: u32,
        mb_per_processor: u64,
    ) -> Result<CgroupPair> {
        self.remove(name).await?;

        if self.version != CgroupVersion::V1 {
            // Controllers must be delegated down to the instance level
            let _ = fs::write(self.root.join("cgroup.subtree_control"), "+cpu +memory").await;
        }
        for subtree in self.subtrees() {
            fs::create_dir_all(&subtree)
                .await
                .map_err(|e| FactoryError::resource("cgroup", format!("{}: {}", subtree.display(), e)))?;
            if self.version != CgroupVersion::V1 {
                let _ = fs::write(subtree.join("cgroup.subtree_control"), "+cpu +memory").await;
            }
        }

        for dir in self.dirs(name) {
            fs::create_dir(&dir)
                .await
                .map_err(|e| FactoryError::resource("cgroup", format!("{}: {}", dir.display(), e)))?;
        }

        let pair = self.pair(name);
        let memory_bytes = u64::from(processors) * mb_per_processor * 1024 * 1024;
        match self.version {
            CgroupVersion::V1 => {
                write_control(
                    &pair.cpu.join("cpu.shares"),
                    u64::from(processors) * CPU_SHARES_PER_PROCESSOR,
                )
                .await?;
                write_control(&pair.memory.join("memory.soft_limit_in_bytes"), memory_bytes)
                    .await?;
            }
            _ => {
                let weight = (u64::from(processors) * CPU_WEIGHT_PER_PROCESSOR).clamp(1, 10000);
                write_control(&pair.cpu.join("cpu.weight"), weight).await?;
                write_control(&pair.memory.join("memory.high"), memory_bytes).await?;
            }
        }

        debug!(cgroup = %name, processors = processors, "Created cgroups");
        Ok(pair)
    }

    /// Remove the cgroups of `name`; absent cgroups are not an error
    ///
    /// Fails while the cgroup still has member processes.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let members = self.procs(name).await;
        if !members.is_empty() {
            return Err(FactoryError::resource(
                "cgroup",
                format!("{} still has {} member processes", name, members.len()),
            ));
        }

        let mut removed = false;
        for dir in self.dirs(name) {
            match fs::remove_dir(&dir).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ENOTEMPTY as i32) => {
                    // Plain directories standing in for a cgroup mount
                    fs::remove_dir_all(&dir).await.map_err(|e| {
                        FactoryError::resource("cgroup", format!("{}: {}", dir.display(), e))
                    })?;
                    removed = true;
                }
                Err(e) => {
                    return Err(FactoryError::resource(
                        "cgroup",
                        format!("{}: {}", dir.display(), e),
                    ))
                }
            }
        }
        Ok(removed)
    }

    /// Member process IDs of `name`, empty when it does not exist
    pub async fn procs(&self, name: &str) -> Vec<u32> {
        let mut pids = Vec::new();
        for dir in self.dirs(name) {
            if let Ok(content) = fs::read_to_string(dir.join("cgroup.procs")).await {
                for pid in parse_procs(&content) {
                    if !pids.contains(&pid) {
                        pids.push(pid);
                    }
                }
            }
        }
        pids
    }

    /// Names of every managed cgroup
    pub async fn list(&self) -> Vec<String> {
        let mut names = Vec::new();
        for subtree in self.subtrees() {
            let Ok(mut entries) = fs::read_dir(&subtree).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                let name = entry.file_name().to_string_lossy().to_string();
                if is_dir && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        names
    }

    /// Remove every managed cgroup without member processes
    pub async fn prune_unused(&self) -> Vec<String> {
        let mut pruned = Vec::new();
        for name in self.list().await {
            if !self.procs(&name).await.is_empty() {
                continue;
            }
            match self.remove(&name).await {
                Ok(true) => pruned.push(name),
                Ok(false) => {}
                Err(e) => warn!(cgroup = %name, error = %e, "Failed to prune cgroup"),
            }
        }
        pruned
    }

    /// Accumulated CPU time of instance `name`
    pub async fn cpu_seconds(&self, name: &str) -> Option<f64> {
        self.cpu_seconds_at(&self.pair(name).cpu).await
    }

    /// Accumulated CPU time of a Docker container, from the runtime's cgroup
    ///
    /// On v2 the systemd driver's scope is tried before the cgroupfs
    /// driver's `docker/<id>`.
    pub async fn docker_cpu_seconds(&self, container_id: &str) -> Option<f64> {
        match self.version {
            CgroupVersion::V1 => {
                let path = self.root.join("cpuacct").join("docker").join(container_id);
                self.cpu_seconds_at(&path).await
            }
            _ => {
                let scope = self
                    .root
                    .join("system.slice")
                    .join(format!("docker-{}.scope", container_id));
                match self.cpu_seconds_at(&scope).await {
                    Some(seconds) => Some(seconds),
                    None => {
                        let path = self.root.join("docker").join(container_id);
                        self.cpu_seconds_at(&path).await
                    }
                }
            }
        }
    }

    async fn cpu_seconds_at(&self, path: &Path) -> Option<f64> {
        match self.version {
            CgroupVersion::V1 => {
                let content = fs::read_to_string(path.join("cpuacct.usage")).await.ok()?;
                let nanos: u64 = content.trim().parse().ok()?;
                Some(nanos as f64 / 1e9)
            }
            _ => {
                let content = fs::read_to_string(path.join("cpu.stat")).await.ok()?;
                Some(parse_cpu_stat(&content)? as f64 / 1e6)
            }
        }
    }

    /// Open the `cgroup.procs` files of `name` for writing
    ///
    /// Opened before forking so the child only needs to write to them.
    pub fn open_procs_files(&self, name: &str) -> Result<Vec<std::fs::File>> {
        self.dirs(name)
            .into_iter()
            .map(|dir| {
                let path = dir.join("cgroup.procs");
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(|e| FactoryError::resource("cgroup", format!("{}: {}", path.display(), e)))
            })
            .collect()
    }
}

async fn write_control(path: &Path, value: u64) -> Result<()> {
    fs::write(path, value.to_string())
        .await
        .map_err(|e| FactoryError::resource("cgroup", format!("{}: {}", path.display(), e)))
}
