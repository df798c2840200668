//! Docker containers driven through the `docker` CLI

use super::{is_not_found, BackendDriver, CommandOutput, CommandRunner, LaunchSpec, LiveInstance, Liveness};
use crate::args;
use crate::config::NetworkMode;
use crate::error::{FactoryError, Result};
use crate::images::REGISTRY_SCHEME;
use crate::models::{BackendKind, BackendModel};
use crate::provision::cgroup::CgroupManager;
use crate::store::files;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const LABEL_SPACE: &str = "factoryd.space";
pub const LABEL_FACTORY: &str = "factoryd.factory";
pub const LABEL_MACHINETYPE: &str = "factoryd.machinetype";

/// User-defined network the NAT addresses live on
pub const NAT_NETWORK: &str = "factoryd";

pub struct DockerDriver {
    runner: Arc<dyn CommandRunner>,
    cgroups: Arc<CgroupManager>,
    grace: Duration,
}

impl DockerDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, cgroups: Arc<CgroupManager>, grace: Duration) -> Self {
        Self {
            runner,
            cgroups,
            grace,
        }
    }

    async fn docker(&self, args: Vec<String>) -> Result<CommandOutput> {
        self.runner
            .run("docker", &args)
            .await
            .map_err(|e| FactoryError::backend(BackendModel::Docker, format!("docker: {}", e)))
    }
}

/// Arguments for `docker run`
pub fn run_args(spec: &LaunchSpec) -> Vec<String> {
    let dir = &spec.machine_dir;
    let mount = |sub: &str, target: &str, mode: &str| {
        format!("{}:{}{}", dir.join(sub).display(), target, mode)
    };

    let mut args = args![
        "run",
        "--detach",
        "--name",
        spec.hostname,
        "--hostname",
        spec.hostname,
        "--label",
        format!("{}={}", LABEL_SPACE, spec.space),
        "--label",
        format!("{}={}", LABEL_FACTORY, spec.factory),
        "--label",
        format!("{}={}", LABEL_MACHINETYPE, spec.machinetype),
        "--cpus",
        spec.processors,
        "--memory",
        format!("{}m", spec.memory_mb),
        "--volume",
        mount(files::JOBOUTPUTS, "/joboutputs", ""),
        "--volume",
        mount(files::JOBFEATURES, "/jobfeatures", ":ro"),
        "--volume",
        mount(files::MACHINEFEATURES, "/machinefeatures", ":ro"),
    ];

    if let (NetworkMode::Nat { .. }, Some(ip)) = (&spec.network_mode, spec.allocation.network.ip) {
        args.extend(args!["--network", NAT_NETWORK, "--ip", ip]);
    }
    args.extend(args!["--mac-address", spec.allocation.network.mac]);

    args.push(
        spec.image
            .strip_prefix(REGISTRY_SCHEME)
            .unwrap_or(&spec.image)
            .to_string(),
    );
    args.extend(spec.command.split_whitespace().map(str::to_string));
    args
}

#[async_trait]
impl BackendDriver for DockerDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::DockerContainer
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<String> {
        // A leftover container of a finished instance holds the name
        let _ = self.docker(args!["rm", "--force", spec.hostname]).await?;

        let output = self.docker(run_args(spec)).await?;
        if !output.success() {
            return Err(FactoryError::backend(
                spec.model,
                format!("docker run {}: {}", spec.hostname, output.failure_text()),
            ));
        }

        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(FactoryError::backend(
                spec.model,
                format!("docker run {} returned no container ID", spec.hostname),
            ));
        }
        info!(container = %spec.hostname, id = %id, "Started container");
        Ok(id)
    }

    async fn stop(&self, name: &str, instance_id: Option<&str>) -> Result<()> {
        let target = instance_id.unwrap_or(name);

        // docker stop sends SIGTERM, waits, then SIGKILLs
        let stopped = self
            .docker(args!["stop", "--time", self.grace.as_secs(), target])
            .await?;
        if !stopped.success() && is_not_found(&stopped) {
            debug!(container = %name, "Container already gone");
            return Ok(());
        }

        let removed = self.docker(args!["rm", "--force", target]).await?;
        if removed.success() || is_not_found(&removed) {
            Ok(())
        } else {
            Err(FactoryError::backend(
                BackendModel::Docker,
                format!("docker rm {}: {}", name, removed.failure_text()),
            ))
        }
    }

    async fn liveness(&self, name: &str, instance_id: &str) -> Result<Liveness> {
        let output = self
            .docker(args!["inspect", "--format", "{{.Id}} {{.State.Status}}", name])
            .await?;
        if !output.success() {
            return Ok(Liveness::Gone);
        }

        let mut fields = output.stdout.split_whitespace();
        let (Some(id), Some(status)) = (fields.next(), fields.next()) else {
            return Ok(Liveness::Gone);
        };
        if id != instance_id {
            return Ok(Liveness::Gone);
        }

        Ok(match status {
            "running" => Liveness::Running,
            "paused" | "restarting" => Liveness::Paused(status.to_string()),
            _ => Liveness::Gone,
        })
    }

    async fn cpu_seconds(&self, _name: &str, instance_id: &str) -> Result<Option<f64>> {
        Ok(self.cgroups.docker_cpu_seconds(instance_id).await)
    }

    async fn list_live(&self) -> Result<Vec<LiveInstance>> {
        let output = self
            .docker(args!["ps", "--all", "--no-trunc", "--format", "{{.Names}} {{.ID}}"])
            .await?;
        if !output.success() {
            return Err(FactoryError::backend(
                BackendModel::Docker,
                format!("docker ps: {}", output.failure_text()),
            ));
        }

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| {
                let (name, id) = line.trim().split_once(' ')?;
                Some(LiveInstance {
                    name: name.to_string(),
                    instance_id: id.trim().to_string(),
                    kind: BackendKind::DockerContainer,
                    owner_gid: None,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::runner::testing::ScriptedRunner;
    use crate::models::{NetworkAddress, ResourceAllocation};
    use crate::provision::cgroup::CgroupVersion;
    use std::path::PathBuf;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            hostname: "host-01.example.com".into(),
            space: "space.example.com".into(),
            factory: "host.example.com".into(),
            machinetype: "batch".into(),
            model: BackendModel::Docker,
            processors: 2,
            memory_mb: 4096,
            uuid: "unused".into(),
            image: "docker://registry.example.com/worker:latest".into(),
            command: "/bin/sh /user_data".into(),
            machine_dir: PathBuf::from("/var/lib/factoryd/machines/1_batch_host-01.example.com"),
            network_mode: NetworkMode::Nat {
                prefix: [169, 254, 169],
            },
            allocation: ResourceAllocation {
                volume: None,
                volume_bytes: None,
                cgroups: None,
                network: NetworkAddress {
                    ip: Some("169.254.169.1".parse().unwrap()),
                    mac: "56:4D:A9:FE:A9:01".into(),
                },
                root_disk: None,
            },
        }
    }

    fn driver(runner: Arc<ScriptedRunner>) -> DockerDriver {
        DockerDriver::new(
            runner,
            Arc::new(CgroupManager::new("/nonexistent", CgroupVersion::V2)),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_run_args() {
        let args = run_args(&spec());
        let joined = args.join(" ");

        assert!(joined.starts_with("run --detach --name host-01.example.com --hostname host-01.example.com"));
        assert!(joined.contains("--label factoryd.space=space.example.com"));
        assert!(joined.contains("--label factoryd.machinetype=batch"));
        assert!(joined.contains("--cpus 2 --memory 4096m"));
        assert!(joined.contains("1_batch_host-01.example.com/jobfeatures:/jobfeatures:ro"));
        assert!(joined.contains("--network factoryd --ip 169.254.169.1"));
        assert!(joined.contains("--mac-address 56:4D:A9:FE:A9:01"));
        assert!(joined.ends_with("registry.example.com/worker:latest /bin/sh /user_data"));
    }

    #[tokio::test]
    async fn test_start_returns_container_id() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker run", 0, "3f1c9a\n");
        let driver = driver(runner.clone());

        assert_eq!(driver.start(&spec()).await.unwrap(), "3f1c9a");
        let calls = runner.calls();
        assert!(calls[0].starts_with("docker rm --force host-01.example.com"));
        assert!(calls[1].starts_with("docker run"));
    }

    #[tokio::test]
    async fn test_liveness_checks_container_id() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker inspect --format {{.Id}} {{.State.Status}} host-01", 0, "abc running\n");
        runner.on("docker inspect --format {{.Id}} {{.State.Status}} host-02", 0, "def paused\n");
        runner.on("docker inspect", 1, "Error: No such object: host-03");
        let driver = driver(runner);

        assert_eq!(driver.liveness("host-01", "abc").await.unwrap(), Liveness::Running);
        assert_eq!(driver.liveness("host-01", "zzz").await.unwrap(), Liveness::Gone);
        assert_eq!(
            driver.liveness("host-02", "def").await.unwrap(),
            Liveness::Paused("paused".into())
        );
        assert_eq!(driver.liveness("host-03", "ghi").await.unwrap(), Liveness::Gone);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker stop", 1, "Error response from daemon: No such container: abc");
        let driver = driver(runner.clone());

        driver.stop("host-01", Some("abc")).await.unwrap();
        driver.stop("host-01", Some("abc")).await.unwrap();
        assert!(runner.calls_starting_with("docker rm").is_empty());
    }

    #[tokio::test]
    async fn test_stop_waits_grace_then_removes() {
        let runner = Arc::new(ScriptedRunner::new());
        let driver = driver(runner.clone());

        driver.stop("host-01", None).await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "docker stop --time 30 host-01".to_string(),
                "docker rm --force host-01".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_list_live() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker ps", 0, "host-03.example.com 9d2f\nunrelated 77aa\n");
        let driver = driver(runner);

        let live = driver.list_live().await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].name, "host-03.example.com");
        assert_eq!(live[0].instance_id, "9d2f");
    }
}
