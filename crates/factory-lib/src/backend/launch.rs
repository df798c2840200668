//! Step-by-step launch of a container process
//!
//! The child side of the fork runs a fixed sequence of steps before `exec`.
//! Each step first writes its number to a close-on-exec pipe, so when the
//! spawn fails the last number in the pipe names the step that broke.

use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::unistd::{Gid, Uid};
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LaunchStep {
    /// Parent side: pipes, log file and command set up
    Prepare = 0,
    NewSession = 1,
    Namespaces = 2,
    Hostname = 3,
    JoinCgroups = 4,
    DropPrivileges = 5,
    Exec = 6,
}

impl LaunchStep {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Prepare,
            1 => Self::NewSession,
            2 => Self::Namespaces,
            3 => Self::Hostname,
            4 => Self::JoinCgroups,
            5 => Self::DropPrivileges,
            6 => Self::Exec,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::NewSession => "new_session",
            Self::Namespaces => "namespaces",
            Self::Hostname => "hostname",
            Self::JoinCgroups => "join_cgroups",
            Self::DropPrivileges => "drop_privileges",
            Self::Exec => "exec",
        }
    }
}

impl fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spawn failure attributed to one step
#[derive(Debug)]
pub struct LaunchFailure {
    pub step: LaunchStep,
    pub error: std::io::Error,
}

impl fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "launch step {} failed: {}", self.step, self.error)
    }
}

impl std::error::Error for LaunchFailure {}

/// Identity the process runs as after the privilege drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// Everything decided before forking
#[derive(Debug)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Set inside the new UTS namespace
    pub hostname: Option<String>,
    pub namespaces: CloneFlags,
    /// Open `cgroup.procs` files the child adds itself to
    pub cgroup_procs: Vec<File>,
    pub identity: Option<Identity>,
    /// Receives stdout and stderr
    pub log_file: Option<PathBuf>,
}

fn mark(beacon: &File, step: LaunchStep) -> std::io::Result<()> {
    let mut beacon = beacon;
    beacon.write_all(&[step as u8])
}

fn prepare_failure(error: impl Into<std::io::Error>) -> LaunchFailure {
    LaunchFailure {
        step: LaunchStep::Prepare,
        error: error.into(),
    }
}

impl LaunchPlan {
    /// Fork, run the child steps and exec
    ///
    /// Returns the PID, which is also the session ID of the new process.
    pub fn spawn(self) -> Result<u32, LaunchFailure> {
        let (read_end, write_end) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(prepare_failure)?;
        let mut beacon_reader = File::from(read_end);
        let beacon = File::from(write_end);

        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        if let Some(path) = &self.log_file {
            let log = File::create(path).map_err(prepare_failure)?;
            let log_err = log.try_clone().map_err(prepare_failure)?;
            command.stdout(log).stderr(log_err);
        }

        let hostname = self.hostname;
        let namespaces = self.namespaces;
        let cgroup_procs = self.cgroup_procs;
        let identity = self.identity;

        // SAFETY: the closure only performs raw system calls and writes to
        // descriptors opened before the fork; nothing allocates.
        unsafe {
            command.pre_exec(move || {
                mark(&beacon, LaunchStep::NewSession)?;
                nix::unistd::setsid()?;

                mark(&beacon, LaunchStep::Namespaces)?;
                if !namespaces.is_empty() {
                    nix::sched::unshare(namespaces)?;
                }

                if let Some(name) = &hostname {
                    mark(&beacon, LaunchStep::Hostname)?;
                    nix::unistd::sethostname(name)?;
                }

                mark(&beacon, LaunchStep::JoinCgroups)?;
                for procs in &cgroup_procs {
                    // "0" is the writing process itself
                    let mut procs = procs;
                    procs.write_all(b"0")?;
                }

                if let Some(identity) = identity {
                    mark(&beacon, LaunchStep::DropPrivileges)?;
                    let gid = Gid::from_raw(identity.gid);
                    nix::unistd::setgroups(&[gid])?;
                    nix::unistd::setgid(gid)?;
                    nix::unistd::setuid(Uid::from_raw(identity.uid))?;
                }

                mark(&beacon, LaunchStep::Exec)?;
                Ok(())
            });
        }

        let spawned = command.spawn();
        // Drops the parent's copy of the beacon's write end
        drop(command);

        match spawned {
            Ok(child) => child
                .id()
                .ok_or_else(|| prepare_failure(std::io::Error::other("child exited before its PID was read"))),
            Err(error) => {
                let mut steps = [0u8; 16];
                let step = match beacon_reader.read(&mut steps) {
                    Ok(n) if n > 0 => LaunchStep::from_byte(steps[n - 1]).unwrap_or(LaunchStep::Exec),
                    _ => LaunchStep::Prepare,
                };
                Err(LaunchFailure { step, error })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plan(program: &str, args: &[&str]) -> LaunchPlan {
        LaunchPlan {
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            hostname: None,
            namespaces: CloneFlags::empty(),
            cgroup_procs: Vec::new(),
            identity: None,
            log_file: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_starts_new_session() {
        let pid = plan("/bin/sh", &["-c", "sleep 1"]).spawn().unwrap();

        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap();
        let (_, session) = crate::backend::procfs::parse_stat(&stat).unwrap();
        assert_eq!(session, pid);
    }

    #[tokio::test]
    async fn test_failed_exec_is_attributed() {
        let failure = plan("/nonexistent/singularity", &[]).spawn().unwrap_err();
        assert_eq!(failure.step, LaunchStep::Exec);
        assert!(failure.to_string().starts_with("launch step exec failed"));
    }

    #[tokio::test]
    async fn test_child_joins_cgroup_files() {
        let dir = TempDir::new().unwrap();
        let procs_path = dir.path().join("cgroup.procs");
        let procs = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&procs_path)
            .unwrap();

        let mut plan = plan("/bin/sh", &["-c", "exit 0"]);
        plan.cgroup_procs = vec![procs];
        plan.log_file = Some(dir.path().join("log"));
        plan.spawn().unwrap();

        assert_eq!(std::fs::read_to_string(&procs_path).unwrap(), "0");
        assert!(dir.path().join("log").exists());
    }

    #[test]
    fn test_step_bytes_round_trip() {
        for step in [
            LaunchStep::Prepare,
            LaunchStep::NewSession,
            LaunchStep::Namespaces,
            LaunchStep::Hostname,
            LaunchStep::JoinCgroups,
            LaunchStep::DropPrivileges,
            LaunchStep::Exec,
        ] {
            assert_eq!(LaunchStep::from_byte(step as u8), Some(step));
        }
        assert_eq!(LaunchStep::from_byte(42), None);
    }
}
