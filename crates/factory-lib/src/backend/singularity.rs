//! Singularity container processes
//!
//! An instance is a process session started through [`LaunchPlan`]. Its ID is
//! the leader PID, which is also the session ID, and its members are the
//! processes of that session inside the instance's cgroup.

use super::launch::{Identity, LaunchPlan};
use super::procfs::ProcFs;
use super::{wait_for_exit, BackendDriver, LaunchSpec, LiveInstance, Liveness};
use crate::error::{FactoryError, Result};
use crate::models::{BackendKind, BackendModel};
use crate::provision::cgroup::CgroupManager;
use crate::store::files;
use async_trait::async_trait;
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SINGULARITY: &str = "singularity";
const LOG_FILE: &str = "singularity.log";

pub struct SingularityDriver {
    cgroups: Arc<CgroupManager>,
    procfs: ProcFs,
    grace: Duration,
    identity: Option<Identity>,
    program: PathBuf,
}

impl SingularityDriver {
    pub fn new(
        cgroups: Arc<CgroupManager>,
        procfs: ProcFs,
        grace: Duration,
        identity: Option<(u32, u32)>,
    ) -> Self {
        Self {
            cgroups,
            procfs,
            grace,
            identity: identity.map(|(uid, gid)| Identity { uid, gid }),
            program: PathBuf::from(SINGULARITY),
        }
    }

    /// Live members of cgroup `name`, restricted to one session when given
    async fn members(&self, name: &str, session: Option<u32>) -> Vec<u32> {
        let mut members = Vec::new();
        for pid in self.cgroups.procs(name).await {
            let Some(info) = self.procfs.process(pid).await else {
                continue;
            };
            if info.is_zombie() {
                continue;
            }
            if session.map_or(true, |s| s == info.session) {
                members.push(pid);
            }
        }
        members
    }

    fn signal_all(pids: &[u32], signal: Signal) {
        for pid in pids {
            let Ok(raw) = i32::try_from(*pid) else {
                continue;
            };
            if let Err(e) = kill(Pid::from_raw(raw), signal) {
                debug!(pid = pid, signal = ?signal, error = %e, "Signal not delivered");
            }
        }
    }
}

/// Arguments passed to `singularity`
pub fn exec_args(spec: &LaunchSpec) -> Vec<String> {
    let dir = &spec.machine_dir;
    let bind = |sub: &str| format!("{}:/{}", dir.join(sub).display(), sub);

    let mut args = vec![
        "exec".to_string(),
        "--contain".to_string(),
        "--ipc".to_string(),
        "--pid".to_string(),
        "--home".to_string(),
        format!("{}:/home", dir.join(files::JOBOUTPUTS).display()),
    ];
    for sub in [files::JOBOUTPUTS, files::JOBFEATURES, files::MACHINEFEATURES] {
        args.push("--bind".to_string());
        args.push(bind(sub));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.split_whitespace().map(str::to_string));
    args
}

#[async_trait]
impl BackendDriver for SingularityDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::SingularityContainer
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<String> {
        if spec.allocation.cgroups.is_none() {
            return Err(FactoryError::backend(
                BackendModel::Singularity,
                format!("no cgroups allocated for {}", spec.hostname),
            ));
        }
        let cgroup_procs = self.cgroups.open_procs_files(&spec.hostname)?;

        let plan = LaunchPlan {
            program: self.program.clone(),
            args: exec_args(spec),
            hostname: Some(spec.hostname.clone()),
            namespaces: CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC,
            cgroup_procs,
            identity: self.identity,
            log_file: Some(spec.machine_dir.join(files::JOBOUTPUTS).join(LOG_FILE)),
        };

        let pid = plan.spawn().map_err(|failure| {
            FactoryError::backend(
                BackendModel::Singularity,
                format!("{}: {}", spec.hostname, failure),
            )
        })?;

        crate::store::write_atomic(spec.machine_dir.join(files::PID), format!("{}\n", pid))?;
        info!(instance = %spec.hostname, pid = pid, "Started container process");
        Ok(pid.to_string())
    }

    async fn stop(&self, name: &str, instance_id: Option<&str>) -> Result<()> {
        let session = instance_id.and_then(|id| id.parse::<u32>().ok());
        let members = self.members(name, session).await;
        if members.is_empty() {
            debug!(instance = %name, "Container process already gone");
            return Ok(());
        }

        Self::signal_all(&members, Signal::SIGTERM);
        if wait_for_exit(self.grace, || async { self.members(name, session).await.is_empty() }).await {
            return Ok(());
        }

        let survivors = self.members(name, session).await;
        warn!(instance = %name, survivors = survivors.len(), "Processes ignored SIGTERM, killing");
        Self::signal_all(&survivors, Signal::SIGKILL);
        Ok(())
    }

    async fn liveness(&self, name: &str, instance_id: &str) -> Result<Liveness> {
        let Ok(pid) = instance_id.parse::<u32>() else {
            return Ok(Liveness::Gone);
        };
        let Some(info) = self.procfs.process(pid).await else {
            return Ok(Liveness::Gone);
        };
        // A recycled PID leads some other session
        if info.is_zombie() || info.session != pid {
            return Ok(Liveness::Gone);
        }
        if !self.cgroups.procs(name).await.contains(&pid) {
            return Ok(Liveness::Gone);
        }

        Ok(if info.is_stopped() {
            Liveness::Paused("stopped".to_string())
        } else {
            Liveness::Running
        })
    }

    async fn cpu_seconds(&self, name: &str, _instance_id: &str) -> Result<Option<f64>> {
        Ok(self.cgroups.cpu_seconds(name).await)
    }

    async fn list_live(&self) -> Result<Vec<LiveInstance>> {
        let mut live = Vec::new();
        for name in self.cgroups.list().await {
            // session -> (leader gid, first member gid)
            let mut sessions: BTreeMap<u32, (Option<u32>, Option<u32>)> = BTreeMap::new();
            for pid in self.cgroups.procs(&name).await {
                let Some(info) = self.procfs.process(pid).await else {
                    continue;
                };
                if info.is_zombie() {
                    continue;
                }
                let entry = sessions.entry(info.session).or_insert((None, info.gid));
                if pid == info.session {
                    entry.0 = info.gid;
                }
            }

            for (session, (leader_gid, member_gid)) in sessions {
                live.push(LiveInstance {
                    name: name.clone(),
                    instance_id: session.to_string(),
                    kind: BackendKind::SingularityContainer,
                    owner_gid: leader_gid.or(member_gid),
                });
            }
        }
        Ok(live)
    }
}
