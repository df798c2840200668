//! Resource provisioning for slots
//!
//! Every resource is named after the slot hostname, so allocating always
//! tears down a stale same-named resource first and releasing needs nothing
//! but the name.

pub mod cgroup;
pub mod disk;
pub mod network;

use crate::backend::CommandRunner;
use crate::config::ConfigSnapshot;
use crate::error::Result;
use crate::models::{BackendKind, BackendModel, ResourceAllocation};
use cgroup::CgroupManager;
use disk::{ImageLayers, VolumeManager};
use network::NetworkProvisioner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Root disk overlay inside the machine directory
pub const ROOT_DISK: &str = "root.qcow2";

/// Scratch disk size per processor when no volume group is configured
const SCRATCH_GB_PER_PROCESSOR: u64 = 20;

/// What one slot needs
#[derive(Debug, Clone)]
pub struct AllocationRequest<'a> {
    pub hostname: &'a str,
    pub ordinal: usize,
    pub model: BackendModel,
    pub processors: u32,
    /// Local root image, already resolved
    pub image: &'a str,
    pub machine_dir: &'a Path,
}

/// The only writer of volume group, cgroup and network reservation state
pub struct Provisioner {
    runner: Arc<dyn CommandRunner>,
    cgroups: Arc<CgroupManager>,
}

impl Provisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, cgroups: Arc<CgroupManager>) -> Self {
        Self { runner, cgroups }
    }

    pub fn cgroups(&self) -> &Arc<CgroupManager> {
        &self.cgroups
    }

    /// Allocate everything the slot needs
    ///
    /// On failure whatever was already allocated is released again before
    /// the error is returned.
    pub async fn allocate(
        &self,
        snapshot: &ConfigSnapshot,
        request: &AllocationRequest<'_>,
    ) -> Result<ResourceAllocation> {
        match self.try_allocate(snapshot, request).await {
            Ok(allocation) => Ok(allocation),
            Err(e) => {
                if let Err(cleanup) = self
                    .release(snapshot, request.hostname, Some(request.machine_dir))
                    .await
                {
                    warn!(slot = %request.hostname, error = %cleanup, "Cleanup after failed allocation incomplete");
                }
                Err(e)
            }
        }
    }

    async fn try_allocate(
        &self,
        snapshot: &ConfigSnapshot,
        request: &AllocationRequest<'_>,
    ) -> Result<ResourceAllocation> {
        let network = NetworkProvisioner::new(snapshot).address(request.ordinal)?;
        let mut allocation = ResourceAllocation {
            volume: None,
            volume_bytes: None,
            cgroups: None,
            network,
            root_disk: None,
        };

        match request.model.kind() {
            BackendKind::Vm => {
                if let Some(vg) = &snapshot.volume_group {
                    let (device, bytes) = VolumeManager::new(self.runner.clone(), vg)
                        .allocate(
                            request.hostname,
                            request.processors,
                            snapshot.total_processors,
                            snapshot.gb_per_processor,
                            &snapshot.hostnames(),
                        )
                        .await?;
                    allocation.volume = Some(device);
                    allocation.volume_bytes = Some(bytes);
                }

                let layers = ImageLayers::new(self.runner.clone());
                let root = request.machine_dir.join(ROOT_DISK);
                match request.model {
                    BackendModel::CernVm3 if allocation.volume.is_none() => {
                        let gb = snapshot.gb_per_processor.unwrap_or(SCRATCH_GB_PER_PROCESSOR);
                        let bytes = gb * 1024 * 1024 * 1024 * u64::from(request.processors);
                        allocation.root_disk = Some(layers.create_scratch(&root, bytes).await?);
                        allocation.volume_bytes = Some(bytes);
                    }
                    BackendModel::CernVm3 => {}
                    _ => {
                        allocation.root_disk = Some(
                            layers
                                .create_overlay(Path::new(request.image), &root)
                                .await?,
                        );
                    }
                }
            }
            BackendKind::SingularityContainer => {
                allocation.cgroups = Some(
                    self.cgroups
                        .create(request.hostname, request.processors, snapshot.mb_per_processor)
                        .await?,
                );
            }
            BackendKind::DockerContainer => {}
        }

        debug!(slot = %request.hostname, allocation = ?allocation, "Allocated resources");
        Ok(allocation)
    }

    /// Free the backend-facing copy of copy-on-write disks
    ///
    /// Called once the backend has the files open.
    pub fn discard_disks(&self, allocation: &ResourceAllocation) -> Result<()> {
        if let Some(root) = &allocation.root_disk {
            disk::discard(root)?;
        }
        Ok(())
    }

    /// Release every resource named after `hostname`; absent ones are fine
    pub async fn release(
        &self,
        snapshot: &ConfigSnapshot,
        hostname: &str,
        machine_dir: Option<&Path>,
    ) -> Result<()> {
        let mut first_error = None;

        if let Some(vg) = &snapshot.volume_group {
            if let Err(e) = VolumeManager::new(self.runner.clone(), vg).remove(hostname).await {
                warn!(slot = %hostname, error = %e, "Failed to remove volume");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.cgroups.remove(hostname).await {
            warn!(slot = %hostname, error = %e, "Failed to remove cgroups");
            first_error.get_or_insert(e);
        }

        if let Some(dir) = machine_dir {
            let root: PathBuf = dir.join(ROOT_DISK);
            if let Err(e) = disk::discard(&root) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Keep DHCP and hosts entries for every slot
    pub fn ensure_network(&self, snapshot: &ConfigSnapshot) -> Result<bool> {
        NetworkProvisioner::new(snapshot).ensure_reservations(&snapshot.hostnames())
    }

    pub async fn prune_cgroups(&self) -> Vec<String> {
        self.cgroups.prune_unused().await
    }
}
