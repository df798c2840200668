//! Hypervisor domains driven through `virsh`

use super::{is_not_found, wait_for_exit, BackendDriver, CommandRunner, LaunchSpec, LiveInstance, Liveness};
use crate::args;
use crate::config::NetworkMode;
use crate::error::{FactoryError, Result};
use crate::models::{BackendKind, BackendModel};
use crate::store::write_atomic;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bridge served by the factory's DHCP reservations in NAT mode
pub const NAT_BRIDGE: &str = "factoryd0";

const DOMAIN_XML: &str = "domain.xml";
const CONSOLE_LOG: &str = "console.log";

pub struct VmDriver {
    runner: Arc<dyn CommandRunner>,
    grace: Duration,
}

impl VmDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, grace: Duration) -> Self {
        Self { runner, grace }
    }

    async fn virsh(&self, args: Vec<String>) -> Result<super::CommandOutput> {
        self.runner
            .run("virsh", &args)
            .await
            .map_err(|e| FactoryError::backend(BackendModel::VmRaw, format!("virsh: {}", e)))
    }

    /// Domain state as reported by `virsh domstate`, `None` when undefined
    async fn domstate(&self, target: &str) -> Result<Option<String>> {
        let output = self.virsh(args!["domstate", target]).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }

    async fn exists(&self, target: &str) -> bool {
        match self.domstate(target).await {
            Ok(Some(state)) => state != "shut off",
            _ => false,
        }
    }
}

/// Parse the `CPU time:` line of `virsh dominfo`
pub fn parse_dominfo_cpu(content: &str) -> Option<f64> {
    content.lines().find_map(|line| {
        let value = line.strip_prefix("CPU time:")?.trim();
        value.trim_end_matches('s').parse().ok()
    })
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// Libvirt domain definition for `spec`
pub fn domain_xml(spec: &LaunchSpec) -> String {
    let mut xml = String::new();
    let boot = if spec.model == BackendModel::CernVm3 {
        "cdrom"
    } else {
        "hd"
    };

    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", xml_escape(&spec.hostname));
    let _ = writeln!(xml, "  <uuid>{}</uuid>", spec.uuid);
    let _ = writeln!(xml, "  <memory unit='MiB'>{}</memory>", spec.memory_mb);
    let _ = writeln!(xml, "  <vcpu>{}</vcpu>", spec.processors);
    let _ = writeln!(
        xml,
        "  <os>\n    <type arch='x86_64'>hvm</type>\n    <boot dev='{}'/>\n  </os>",
        boot
    );
    let _ = writeln!(xml, "  <features><acpi/><apic/></features>");
    let _ = writeln!(xml, "  <on_poweroff>destroy</on_poweroff>");
    let _ = writeln!(xml, "  <on_reboot>destroy</on_reboot>");
    let _ = writeln!(xml, "  <on_crash>destroy</on_crash>");
    let _ = writeln!(xml, "  <devices>");

    if spec.model == BackendModel::CernVm3 {
        let _ = writeln!(
            xml,
            "    <disk type='file' device='cdrom'>\n      <driver name='qemu' type='raw'/>\n      <source file='{}'/>\n      <target dev='hdc' bus='ide'/>\n      <readonly/>\n    </disk>",
            xml_escape(&spec.image)
        );
    }
    if let Some(root) = &spec.allocation.root_disk {
        let _ = writeln!(
            xml,
            "    <disk type='file' device='disk'>\n      <driver name='qemu' type='qcow2' cache='unsafe'/>\n      <source file='{}'/>\n      <target dev='vda' bus='virtio'/>\n    </disk>",
            xml_escape(&root.to_string_lossy())
        );
    }
    if let Some(volume) = &spec.allocation.volume {
        let _ = writeln!(
            xml,
            "    <disk type='block' device='disk'>\n      <driver name='qemu' type='raw' cache='none'/>\n      <source dev='{}'/>\n      <target dev='vdb' bus='virtio'/>\n    </disk>",
            xml_escape(&volume.to_string_lossy())
        );
    }

    let bridge = match &spec.network_mode {
        NetworkMode::Nat { .. } => NAT_BRIDGE,
        NetworkMode::Bridge { device } => device.as_str(),
    };
    let _ = writeln!(
        xml,
        "    <interface type='bridge'>\n      <source bridge='{}'/>\n      <mac address='{}'/>\n      <model type='virtio'/>\n    </interface>",
        xml_escape(bridge),
        spec.allocation.network.mac
    );
    let _ = writeln!(
        xml,
        "    <serial type='file'>\n      <source path='{}'/>\n      <target port='0'/>\n    </serial>",
        xml_escape(&spec.machine_dir.join(CONSOLE_LOG).to_string_lossy())
    );
    let _ = writeln!(xml, "  </devices>");
    let _ = writeln!(xml, "</domain>");
    xml
}

#[async_trait]
impl BackendDriver for VmDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Vm
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<String> {
        let xml_path = spec.machine_dir.join(DOMAIN_XML);
        write_atomic(&xml_path, domain_xml(spec))?;

        let output = self
            .virsh(args!["create", xml_path.to_string_lossy()])
            .await?;
        if !output.success() {
            return Err(FactoryError::backend(
                spec.model,
                format!("virsh create {}: {}", spec.hostname, output.failure_text()),
            ));
        }

        info!(domain = %spec.hostname, uuid = %spec.uuid, "Created domain");
        Ok(spec.uuid.clone())
    }

    async fn stop(&self, name: &str, instance_id: Option<&str>) -> Result<()> {
        let target = instance_id.unwrap_or(name);
        if !self.exists(target).await {
            debug!(domain = %name, "Domain already gone");
            return Ok(());
        }

        let _ = self.virsh(args!["shutdown", target]).await?;
        if wait_for_exit(self.grace, || async { !self.exists(target).await }).await {
            return Ok(());
        }

        warn!(domain = %name, "Domain ignored shutdown, destroying");
        let output = self.virsh(args!["destroy", target]).await?;
        if output.success() || is_not_found(&output) {
            Ok(())
        } else {
            Err(FactoryError::backend(
                BackendModel::VmRaw,
                format!("virsh destroy {}: {}", name, output.failure_text()),
            ))
        }
    }

    async fn liveness(&self, name: &str, instance_id: &str) -> Result<Liveness> {
        let output = self.virsh(args!["domuuid", name]).await?;
        if !output.success() || output.stdout.trim() != instance_id {
            return Ok(Liveness::Gone);
        }

        Ok(match self.domstate(name).await?.as_deref() {
            None | Some("shut off") | Some("crashed") => Liveness::Gone,
            Some("running") | Some("idle") | Some("blocked") | Some("in shutdown") => {
                Liveness::Running
            }
            Some(other) => Liveness::Paused(other.to_string()),
        })
    }

    async fn cpu_seconds(&self, _name: &str, instance_id: &str) -> Result<Option<f64>> {
        let output = self.virsh(args!["dominfo", instance_id]).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_dominfo_cpu(&output.stdout))
    }

    async fn list_live(&self) -> Result<Vec<LiveInstance>> {
        let output = self.virsh(args!["list", "--all", "--name"]).await?;
        if !output.success() {
            return Err(FactoryError::backend(
                BackendModel::VmRaw,
                format!("virsh list: {}", output.failure_text()),
            ));
        }

        let mut live = Vec::new();
        for name in output.stdout.lines().map(str::trim).filter(|n| !n.is_empty()) {
            let uuid = self.virsh(args!["domuuid", name]).await?;
            if !uuid.success() {
                continue;
            }
            live.push(LiveInstance {
                name: name.to_string(),
                instance_id: uuid.stdout.trim().to_string(),
                kind: BackendKind::Vm,
                owner_gid: None,
            });
        }
        Ok(live)
    }
}
