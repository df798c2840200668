//! Execution backends
//!
//! Every backend model is realised by one [`BackendDriver`]: hypervisor
//! domains, Docker containers or Singularity container processes. The slot
//! manager and the reaper only ever talk to the trait; the model name is used
//! once, in [`DriverSet::for_model`], to pick the driver.

pub mod docker;
pub mod launch;
pub mod procfs;
pub mod runner;
pub mod singularity;
pub mod vm;

pub use docker::DockerDriver;
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
pub use singularity::SingularityDriver;
pub use vm::VmDriver;

use crate::config::{ConfigSnapshot, NetworkMode};
use crate::error::Result;
use crate::models::{BackendKind, BackendModel, ResourceAllocation};
use crate::provision::cgroup::CgroupManager;
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything a driver needs to start one instance
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub hostname: String,
    pub space: String,
    pub factory: String,
    pub machinetype: String,
    pub model: BackendModel,
    pub processors: u32,
    pub memory_mb: u64,
    /// Generated identity, used as the domain UUID by the VM driver
    pub uuid: String,
    /// Local image path or container registry reference
    pub image: String,
    pub command: String,
    pub machine_dir: PathBuf,
    pub network_mode: NetworkMode,
    pub allocation: ResourceAllocation,
}

/// Backend view of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Present but in an unexpected state, carrying the backend's wording
    Paused(String),
    Gone,
}

/// An instance the backend reports as existing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveInstance {
    pub name: String,
    pub instance_id: String,
    pub kind: BackendKind,
    /// Group of the instance's lead process, container processes only
    pub owner_gid: Option<u32>,
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start the instance and return its backend-assigned ID
    async fn start(&self, spec: &LaunchSpec) -> Result<String>;

    /// Graceful stop, grace period, then forced kill
    ///
    /// Succeeds when the instance is already gone. With an instance ID only
    /// that exact instance is targeted.
    async fn stop(&self, name: &str, instance_id: Option<&str>) -> Result<()>;

    async fn liveness(&self, name: &str, instance_id: &str) -> Result<Liveness>;

    /// Accumulated CPU time, `None` when no accounting is available
    async fn cpu_seconds(&self, name: &str, instance_id: &str) -> Result<Option<f64>>;

    /// Every instance this backend currently holds
    async fn list_live(&self) -> Result<Vec<LiveInstance>>;
}

/// One driver per backend family
#[derive(Clone)]
pub struct DriverSet {
    vm: Arc<dyn BackendDriver>,
    docker: Arc<dyn BackendDriver>,
    singularity: Arc<dyn BackendDriver>,
}

impl DriverSet {
    pub fn new(
        vm: Arc<dyn BackendDriver>,
        docker: Arc<dyn BackendDriver>,
        singularity: Arc<dyn BackendDriver>,
    ) -> Self {
        Self {
            vm,
            docker,
            singularity,
        }
    }

    /// Drivers talking to the host's real tools
    pub fn system(
        snapshot: &ConfigSnapshot,
        runner: Arc<dyn CommandRunner>,
        cgroups: Arc<CgroupManager>,
    ) -> Self {
        let grace = snapshot.shutdown_grace;
        Self::new(
            Arc::new(VmDriver::new(runner.clone(), grace)),
            Arc::new(DockerDriver::new(runner, cgroups.clone(), grace)),
            Arc::new(SingularityDriver::new(
                cgroups,
                procfs::ProcFs::new(&snapshot.proc_root),
                grace,
                snapshot.managed_uid.zip(snapshot.managed_gid),
            )),
        )
    }

    pub fn for_model(&self, model: BackendModel) -> &Arc<dyn BackendDriver> {
        self.for_kind(model.kind())
    }

    pub fn for_kind(&self, kind: BackendKind) -> &Arc<dyn BackendDriver> {
        match kind {
            BackendKind::Vm => &self.vm,
            BackendKind::DockerContainer => &self.docker,
            BackendKind::SingularityContainer => &self.singularity,
        }
    }

    pub fn all(&self) -> [&Arc<dyn BackendDriver>; 3] {
        [&self.vm, &self.docker, &self.singularity]
    }
}

const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `gone` until it reports true or `grace` runs out
///
/// Returns whether the instance went away in time.
pub(crate) async fn wait_for_exit<F, Fut>(grace: Duration, mut gone: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if gone().await {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// Backend CLI messages meaning the instance no longer exists
pub(crate) fn is_not_found(output: &CommandOutput) -> bool {
    let text = format!("{} {}", output.stdout, output.stderr).to_lowercase();
    ["no such container", "not found", "failed to get domain", "domain is not running", "is not running"]
        .iter()
        .any(|needle| text.contains(needle))
}
