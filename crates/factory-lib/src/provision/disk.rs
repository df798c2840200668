//! Block storage for virtual machines
//!
//! Two strategies: logical volumes carved from a volume group, or qcow2
//! images layered over a shared base image when no volume group is set.

use crate::args;
use crate::backend::{CommandOutput, CommandRunner};
use crate::error::{FactoryError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const GIB: u64 = 1024 * 1024 * 1024;

/// Extent geometry of a volume group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGroupInfo {
    pub extent_size: u64,
    pub extent_count: u64,
}

impl VolumeGroupInfo {
    pub fn total_bytes(&self) -> u64 {
        self.extent_size * self.extent_count
    }

    pub fn round_down(&self, bytes: u64) -> u64 {
        if self.extent_size == 0 {
            return bytes;
        }
        bytes - bytes % self.extent_size
    }
}

/// Parse `vgs -o vg_extent_size,vg_extent_count` with `:` separators
pub fn parse_vgs(output: &str) -> Option<VolumeGroupInfo> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (size, count) = line.split_once(':')?;
    Some(VolumeGroupInfo {
        extent_size: size.trim().parse().ok()?,
        extent_count: count.trim().parse().ok()?,
    })
}

/// Parse `lvs -o lv_name,lv_size` with `:` separators
pub fn parse_lvs(output: &str) -> Vec<(String, u64)> {
    output
        .lines()
        .filter_map(|line| {
            let (name, size) = line.trim().split_once(':')?;
            Some((name.trim().to_string(), size.trim().parse().ok()?))
        })
        .collect()
}

/// Size of a slot's volume when no fixed size is configured
///
/// The capacity not taken by volumes other tools own is shared out per
/// configured processor; the result is rounded down to whole extents.
pub fn fair_share_bytes(
    info: &VolumeGroupInfo,
    non_managed_bytes: u64,
    total_processors: u32,
    processors: u32,
) -> u64 {
    if total_processors == 0 {
        return 0;
    }
    let available = info.total_bytes().saturating_sub(non_managed_bytes);
    let per_processor = available / u64::from(total_processors);
    info.round_down(per_processor * u64::from(processors))
}

/// Logical volumes named after slot hostnames
pub struct VolumeManager {
    runner: Arc<dyn CommandRunner>,
    volume_group: String,
}

impl VolumeManager {
    pub fn new(runner: Arc<dyn CommandRunner>, volume_group: impl Into<String>) -> Self {
        Self {
            runner,
            volume_group: volume_group.into(),
        }
    }

    pub fn device(&self, name: &str) -> PathBuf {
        PathBuf::from("/dev").join(&self.volume_group).join(name)
    }

    async fn run(&self, step: &'static str, program: &str, args: Vec<String>) -> Result<CommandOutput> {
        self.runner
            .run(program, &args)
            .await
            .map_err(|e| FactoryError::resource(step, format!("{}: {}", program, e)))
    }

    pub async fn info(&self) -> Result<VolumeGroupInfo> {
        let output = self
            .run(
                "vgs",
                "vgs",
                args![
                    "--noheadings",
                    "--nosuffix",
                    "--units",
                    "b",
                    "--separator",
                    ":",
                    "-o",
                    "vg_extent_size,vg_extent_count",
                    self.volume_group
                ],
            )
            .await?;
        if !output.success() {
            return Err(FactoryError::resource("vgs", output.failure_text()));
        }
        parse_vgs(&output.stdout).ok_or_else(|| {
            FactoryError::resource("vgs", format!("unreadable output {:?}", output.stdout.trim()))
        })
    }

    pub async fn volumes(&self) -> Result<Vec<(String, u64)>> {
        let output = self
            .run(
                "lvs",
                "lvs",
                args![
                    "--noheadings",
                    "--nosuffix",
                    "--units",
                    "b",
                    "--separator",
                    ":",
                    "-o",
                    "lv_name,lv_size",
                    self.volume_group
                ],
            )
            .await?;
        if !output.success() {
            return Err(FactoryError::resource("lvs", output.failure_text()));
        }
        Ok(parse_lvs(&output.stdout))
    }

    /// Remove volume `name`, unmounting it and killing its users first
    pub async fn remove(&self, name: &str) -> Result<bool> {
        if !self.volumes().await?.iter().any(|(lv, _)| lv == name) {
            return Ok(false);
        }

        let device = self.device(name);
        let _ = self.run("umount", "umount", args![device.display()]).await;
        let _ = self
            .run("fuser", "fuser", args!["--kill", "--mount", device.display()])
            .await;

        let output = self
            .run(
                "lvremove",
                "lvremove",
                args!["--force", format!("{}/{}", self.volume_group, name)],
            )
            .await?;
        if !output.success() {
            return Err(FactoryError::resource("lvremove", output.failure_text()));
        }
        info!(volume = %name, "Removed logical volume");
        Ok(true)
    }

    /// Fresh volume for `name`, replacing any stale one
    ///
    /// `managed` lists every volume name the factory owns; all others count
    /// as used by someone else when computing the fair share.
    pub async fn allocate(
        &self,
        name: &str,
        processors: u32,
        total_processors: u32,
        gb_per_processor: Option<u64>,
        managed: &[String],
    ) -> Result<(PathBuf, u64)> {
        self.remove(name).await?;

        let info = self.info().await?;
        let bytes = match gb_per_processor {
            Some(gb) => info.round_down(gb * GIB * u64::from(processors)),
            None => {
                let non_managed: u64 = self
                    .volumes()
                    .await?
                    .iter()
                    .filter(|(lv, _)| !managed.contains(lv))
                    .map(|(_, size)| size)
                    .sum();
                fair_share_bytes(&info, non_managed, total_processors, processors)
            }
        };
        if bytes == 0 {
            return Err(FactoryError::resource(
                "lvcreate",
                format!("no space left in {} for {}", self.volume_group, name),
            ));
        }

        let output = self
            .run(
                "lvcreate",
                "lvcreate",
                args![
                    "--yes",
                    "--name",
                    name,
                    "--size",
                    format!("{}b", bytes),
                    self.volume_group
                ],
            )
            .await?;
        if !output.success() {
            return Err(FactoryError::resource("lvcreate", output.failure_text()));
        }

        info!(volume = %name, bytes = bytes, "Created logical volume");
        Ok((self.device(name), bytes))
    }
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
}

/// qcow2 images made with `qemu-img`
pub struct ImageLayers {
    runner: Arc<dyn CommandRunner>,
}

impl ImageLayers {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn qemu_img(&self, args: Vec<String>) -> Result<CommandOutput> {
        let output = self
            .runner
            .run("qemu-img", &args)
            .await
            .map_err(|e| FactoryError::resource("qemu-img", e.to_string()))?;
        if !output.success() {
            return Err(FactoryError::resource("qemu-img", output.failure_text()));
        }
        Ok(output)
    }

    /// Copy-on-write overlay of `base` at `overlay`
    pub async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<PathBuf> {
        discard(overlay)?;

        let info = self
            .qemu_img(args!["info", "--output=json", base.display()])
            .await?;
        let format = serde_json::from_str::<ImageInfo>(&info.stdout)
            .map(|i| i.format)
            .map_err(|e| FactoryError::resource("qemu-img", format!("{}: {}", base.display(), e)))?;

        self.qemu_img(args![
            "create",
            "-f",
            "qcow2",
            "-F",
            format,
            "-b",
            base.display(),
            overlay.display()
        ])
        .await?;
        debug!(overlay = %overlay.display(), base = %base.display(), "Created overlay");
        Ok(overlay.to_path_buf())
    }

    /// Empty sparse qcow2 disk of `bytes`
    pub async fn create_scratch(&self, path: &Path, bytes: u64) -> Result<PathBuf> {
        discard(path)?;
        self.qemu_img(args!["create", "-f", "qcow2", path.display(), bytes])
            .await?;
        Ok(path.to_path_buf())
    }
}

/// Unlink an image file; the space returns once the backend closes it
pub fn discard(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FactoryError::io(path, e)),
    }
}
