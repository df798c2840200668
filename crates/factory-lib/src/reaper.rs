//! Zombie reaper
//!
//! Backend instances carrying one of this factory's slot hostnames are
//! checked against the slot record of that hostname. Anything that does not
//! match the record exactly is stopped by its backend instance ID. Slot
//! records and machine directories are never written here.
//!
//! Sweeps must not overlap creation on the same slot; the control cycle runs
//! both from one task.

use crate::backend::{BackendDriver, LiveInstance};
use crate::config::ConfigSnapshot;
use crate::models::{slot_ordinal, BackendKind, BackendModel, MachineState, ShutdownMessage};
use crate::observability::FactoryMetrics;
use crate::slots::SlotManager;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a live instance is not the one its slot tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZombieReason {
    /// No readable slot record, or no machine directory for it
    NoRecord,
    ModelMismatch { recorded: BackendModel },
    InstanceMismatch { recorded: Option<String> },
    /// The slot's instance was already finalised
    Finished,
    WrongOwner { gid: Option<u32> },
}

impl fmt::Display for ZombieReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRecord => f.write_str("no slot record"),
            Self::ModelMismatch { recorded } => write!(f, "slot records model {}", recorded),
            Self::InstanceMismatch { recorded: Some(id) } => {
                write!(f, "slot records instance {}", id)
            }
            Self::InstanceMismatch { recorded: None } => f.write_str("slot records no instance"),
            Self::Finished => f.write_str("slot instance already finished"),
            Self::WrongOwner { gid } => write!(f, "owned by gid {:?}", gid),
        }
    }
}

/// One instance the sweep stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZombieKill {
    pub name: String,
    pub kind: BackendKind,
    pub instance_id: String,
    pub reason: ZombieReason,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReapReport {
    pub zombies: Vec<ZombieKill>,
    /// Paused slots destroyed through the slot manager
    pub reclaimed: Vec<String>,
    pub pruned_cgroups: Vec<String>,
    pub failures: usize,
}

const PAUSED: (u16, &str) = (700, "Instance paused");

/// Cross-checks backend instances against slot records
pub struct Reaper {
    manager: Arc<SlotManager>,
    metrics: FactoryMetrics,
}

impl Reaper {
    pub fn new(manager: Arc<SlotManager>) -> Self {
        Self {
            manager,
            metrics: FactoryMetrics::new(),
        }
    }

    /// Decide whether `instance` is a zombie
    ///
    /// `None` means it is the instance its slot tracks.
    pub fn judge(&self, snapshot: &ConfigSnapshot, instance: &LiveInstance) -> Option<ZombieReason> {
        let store = self.manager.store();
        let Some(record) = store.read_slot_record(&instance.name) else {
            return Some(ZombieReason::NoRecord);
        };
        let dir = store.machine_dir(&instance.name, &record);
        if !dir.exists() {
            return Some(ZombieReason::NoRecord);
        }
        if record.model.kind() != instance.kind {
            return Some(ZombieReason::ModelMismatch {
                recorded: record.model,
            });
        }
        let recorded = dir.uuid();
        if recorded.as_deref() != Some(instance.instance_id.as_str()) {
            return Some(ZombieReason::InstanceMismatch { recorded });
        }
        if dir.finished().is_some() {
            return Some(ZombieReason::Finished);
        }
        if instance.kind == BackendKind::SingularityContainer {
            if let Some(expected) = snapshot.managed_gid {
                if instance.owner_gid != Some(expected) {
                    return Some(ZombieReason::WrongOwner {
                        gid: instance.owner_gid,
                    });
                }
            }
        }
        None
    }

    /// One full sweep: zombies, paused slots, unused cgroups
    pub async fn sweep(&self) -> ReapReport {
        let snapshot = self.manager.config().current().await;
        let mut report = ReapReport::default();

        for driver in self.manager.drivers().all() {
            self.reap_driver(&snapshot, driver.as_ref(), &mut report).await;
        }

        for machine in self.manager.machines().await {
            if machine.state != MachineState::Paused {
                continue;
            }
            let (code, text) = PAUSED;
            match self
                .manager
                .destroy(machine.ordinal, Some(ShutdownMessage::new(code, text)))
                .await
            {
                Ok(()) => report.reclaimed.push(machine.hostname),
                Err(e) => {
                    warn!(slot = %machine.hostname, error = %e, "Failed to reclaim paused slot");
                    report.failures += 1;
                }
            }
        }

        report.pruned_cgroups = self.manager.provisioner().prune_cgroups().await;
        report
    }

    async fn reap_driver(
        &self,
        snapshot: &ConfigSnapshot,
        driver: &dyn BackendDriver,
        report: &mut ReapReport,
    ) {
        let live = match driver.list_live().await {
            Ok(live) => live,
            Err(e) => {
                warn!(kind = %driver.kind(), error = %e, "Failed to list backend instances");
                report.failures += 1;
                return;
            }
        };

        for instance in live {
            if slot_ordinal(&snapshot.factory_name, &instance.name).is_none() {
                debug!(instance = %instance.name, "Ignoring instance not named after a slot");
                continue;
            }
            let Some(reason) = self.judge(snapshot, &instance) else {
                continue;
            };

            if let Err(e) = driver.stop(&instance.name, Some(&instance.instance_id)).await {
                warn!(
                    instance = %instance.name,
                    instance_id = %instance.instance_id,
                    error = %e,
                    "Failed to kill zombie"
                );
                report.failures += 1;
                continue;
            }

            self.manager.logger().log_zombie_killed(
                &instance.name,
                instance.kind,
                &instance.instance_id,
                &reason.to_string(),
            );
            self.metrics.inc_zombies_killed(instance.kind);
            report.zombies.push(ZombieKill {
                name: instance.name,
                kind: instance.kind,
                instance_id: instance.instance_id,
                reason,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeDrivers;
    use crate::backend::Liveness;
    use crate::config::testing::snapshot;
    use crate::slots::testing::{slot_fixture, T0};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        fakes: FakeDrivers,
        manager: Arc<SlotManager>,
        reaper: Reaper,
    }

    fn fixture() -> Fixture {
        let f = slot_fixture("docker");
        let reaper = Reaper::new(f.manager.clone());
        Fixture {
            dir: f.dir,
            fakes: f.fakes,
            manager: f.manager,
            reaper,
        }
    }

    fn slot_files(dir: &std::path::Path) -> Vec<(String, String)> {
        let mut files: Vec<(String, String)> = std::fs::read_dir(dir.join("slots"))
            .unwrap()
            .flatten()
            .map(|e| {
                (
                    e.file_name().to_string_lossy().to_string(),
                    std::fs::read_to_string(e.path()).unwrap(),
                )
            })
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_untracked_container_killed_once_without_touching_records() {
        let f = fixture();
        f.manager.create(1, "batch", 1, T0 + 3600).await.unwrap();
        f.fakes
            .docker
            .insert("host-03.example.com", "abc123", Liveness::Running);
        let before = slot_files(f.dir.path());

        let report = f.reaper.sweep().await;

        assert_eq!(
            report.zombies,
            vec![ZombieKill {
                name: "host-03.example.com".into(),
                kind: BackendKind::DockerContainer,
                instance_id: "abc123".into(),
                reason: ZombieReason::NoRecord,
            }]
        );
        assert_eq!(
            f.fakes.docker.stops.lock().unwrap().clone(),
            vec![("host-03.example.com".to_string(), Some("abc123".to_string()))]
        );
        assert_eq!(slot_files(f.dir.path()), before);
        assert!(!f.dir.path().join("slots/host-03.example.com").exists());

        // Gone now, so the next sweep leaves it alone
        let report = f.reaper.sweep().await;
        assert!(report.zombies.is_empty());
        assert_eq!(f.fakes.docker.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_tracked_instance_is_left_alone() {
        let f = fixture();
        f.manager.create(0, "batch", 1, T0 + 3600).await.unwrap();

        let report = f.reaper.sweep().await;

        assert!(report.zombies.is_empty());
        assert_eq!(f.fakes.docker.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_instance_id_and_model_mismatch() {
        let f = fixture();
        f.manager.create(0, "batch", 1, T0 + 3600).await.unwrap();
        // Same name, different container
        f.fakes
            .docker
            .insert("host-00.example.com", "stale", Liveness::Running);
        // A VM using a docker slot's name
        f.fakes.vm.insert("host-00.example.com", "uuid-1", Liveness::Running);

        let report = f.reaper.sweep().await;

        let reasons: Vec<&ZombieReason> = report.zombies.iter().map(|z| &z.reason).collect();
        assert!(reasons.contains(&&ZombieReason::ModelMismatch {
            recorded: BackendModel::Docker
        }));
        assert!(reasons.contains(&&ZombieReason::InstanceMismatch {
            recorded: Some("id-2".into())
        }));
        // The slot's record still points at the original instance
        let machine = f.manager.machine(0).await;
        assert_eq!(machine.uuid.as_deref(), Some("id-2"));
    }

    #[tokio::test]
    async fn test_foreign_names_are_ignored() {
        let f = fixture();
        f.fakes.docker.insert("registry", "r1", Liveness::Running);
        f.fakes
            .vm
            .insert("other-01.example.com", "u1", Liveness::Running);

        let report = f.reaper.sweep().await;

        assert!(report.zombies.is_empty());
        assert_eq!(f.fakes.docker.stop_count() + f.fakes.vm.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_paused_slot_is_reclaimed() {
        let f = fixture();
        f.manager.create(2, "batch", 1, T0 + 3600).await.unwrap();
        f.fakes
            .docker
            .set_liveness("host-02.example.com", Liveness::Paused("paused".into()));

        let report = f.reaper.sweep().await;

        assert_eq!(report.reclaimed, vec!["host-02.example.com".to_string()]);
        let machine = f.manager.machine(2).await;
        assert_eq!(machine.state, MachineState::Shutdown);
        assert_eq!(
            machine.shutdown_message,
            Some(ShutdownMessage::new(700, "Instance paused"))
        );
    }

    #[test]
    fn test_wrong_owner_for_container_processes() {
        let f = fixture();
        let snapshot = singularity_snapshot(&f);
        let store = f.manager.store();
        let record = crate::models::SlotRecord {
            created: T0,
            machinetype: "batch".into(),
            model: BackendModel::Singularity,
        };
        store.write_slot_record("host-01.example.com", &record).unwrap();
        let dir = store.machine_dir("host-01.example.com", &record);
        dir.create().unwrap();
        dir.write_value(crate::store::files::UUID, 4242).unwrap();

        let mut instance = LiveInstance {
            name: "host-01.example.com".into(),
            instance_id: "4242".into(),
            kind: BackendKind::SingularityContainer,
            owner_gid: Some(1500),
        };
        assert_eq!(f.reaper.judge(&snapshot, &instance), None);

        instance.owner_gid = Some(0);
        assert_eq!(
            f.reaper.judge(&snapshot, &instance),
            Some(ZombieReason::WrongOwner { gid: Some(0) })
        );
    }

    fn singularity_snapshot(f: &Fixture) -> ConfigSnapshot {
        snapshot(f.dir.path(), "singularity")
    }
}
