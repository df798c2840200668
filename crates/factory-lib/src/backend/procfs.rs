//! Process inspection through `/proc`

use std::path::PathBuf;
use tokio::fs;

/// What the factory needs to know about one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Single-letter scheduler state from `/proc/<pid>/stat`
    pub state: char,
    pub session: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl ProcessInfo {
    /// Stopped by a signal or a tracer
    pub fn is_stopped(&self) -> bool {
        matches!(self.state, 'T' | 't')
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Parse state and session ID out of `/proc/<pid>/stat`
///
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last closing parenthesis.
pub fn parse_stat(content: &str) -> Option<(char, u32)> {
    let rest = &content[content.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let _pgrp = fields.next()?;
    let session = fields.next()?.parse().ok()?;
    Some((state, session))
}

/// Real user and group IDs from `/proc/<pid>/status`
pub fn parse_status_ids(content: &str) -> (Option<u32>, Option<u32>) {
    let field = |key: &str| {
        content.lines().find_map(|line| {
            line.strip_prefix(key)?
                .split_whitespace()
                .next()?
                .parse()
                .ok()
        })
    };
    (field("Uid:"), field("Gid:"))
}

/// Reader rooted at a configurable `/proc`
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `None` when the process does not exist
    pub async fn process(&self, pid: u32) -> Option<ProcessInfo> {
        let dir = self.root.join(pid.to_string());
        let stat = fs::read_to_string(dir.join("stat")).await.ok()?;
        let (state, session) = parse_stat(&stat)?;
        let (uid, gid) = match fs::read_to_string(dir.join("status")).await {
            Ok(status) => parse_status_ids(&status),
            Err(_) => (None, None),
        };
        Some(ProcessInfo {
            pid,
            state,
            session,
            uid,
            gid,
        })
    }

    /// Live (non-zombie) process
    pub async fn is_alive(&self, pid: u32) -> bool {
        self.process(pid)
            .await
            .map(|p| !p.is_zombie())
            .unwrap_or(false)
    }
}
