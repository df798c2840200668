//! Component health for the daemon's `/healthz` and `/readyz` endpoints
//!
//! The control cycle reports on the slot manager, reaper and provisioner
//! after every pass; the responder reports only when its socket fails. A
//! watched component that stops reporting is shown degraded. The overall
//! status is the worst component status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Last pass completed with per-slot failures, or the component went quiet
    Degraded,
    Unhealthy,
}

/// Last report of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Per-slot operations that failed in the reported pass
    #[serde(default)]
    pub failures: usize,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn at(status: ComponentStatus, message: Option<String>, failures: usize) -> Self {
        Self {
            status,
            message,
            failures,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::at(ComponentStatus::Healthy, None, 0)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::at(ComponentStatus::Degraded, Some(message.into()), 0)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::at(ComponentStatus::Unhealthy, Some(message.into()), 0)
    }

    /// Health after one pass of a loop
    ///
    /// A pass that failed outright is unhealthy; one that completed with
    /// per-slot failures is degraded.
    pub fn from_pass<T, E: std::fmt::Display>(result: &Result<T, E>, failures: usize) -> Self {
        match result {
            Err(e) => Self::at(ComponentStatus::Unhealthy, Some(e.to_string()), failures),
            Ok(_) if failures > 0 => Self::at(
                ComponentStatus::Degraded,
                Some(format!("{} operations failed in the last pass", failures)),
                failures,
            ),
            Ok(_) => Self::healthy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const SLOT_MANAGER: &str = "slot_manager";
    pub const REAPER: &str = "reaper";
    pub const RESPONDER: &str = "responder";
    pub const PROVISIONER: &str = "provisioner";

    /// Reported by the control cycle on every pass
    pub const CYCLE_REPORTED: [&str; 3] = [SLOT_MANAGER, REAPER, PROVISIONER];
}

#[derive(Debug, Default)]
struct Inner {
    components: BTreeMap<String, ComponentHealth>,
    /// Seconds of silence after which a component counts as degraded
    watched: BTreeMap<String, i64>,
    ready: bool,
}

/// Shared view of every component's last report
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Expect a report from `name` at least every `secs` seconds
    pub async fn watch(&self, name: &str, secs: i64) {
        self.inner.write().await.watched.insert(name.to_string(), secs);
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.inner
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Record one pass of a loop
    pub async fn report<T, E: std::fmt::Display>(
        &self,
        name: &str,
        result: &Result<T, E>,
        failures: usize,
    ) {
        self.update(name, ComponentHealth::from_pass(result, failures))
            .await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.ready = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        self.health_at(chrono::Utc::now().timestamp()).await
    }

    /// Health as seen at `now`, downgrading watched components gone quiet
    pub async fn health_at(&self, now: i64) -> HealthResponse {
        let inner = self.inner.read().await;
        let mut components = inner.components.clone();

        for (name, limit) in &inner.watched {
            let Some(health) = components.get_mut(name) else {
                continue;
            };
            let silent = now - health.last_check_timestamp;
            if silent > *limit && health.status == ComponentStatus::Healthy {
                health.status = ComponentStatus::Degraded;
                health.message = Some(format!("no report for {}s", silent));
            }
        }

        let status = components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    /// Ready once the first cycle completed and nothing is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = self.inner.read().await.ready;
        if !ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Factory has not completed its first cycle".to_string()),
            };
        }

        let health = self.health().await;
        let failing: Vec<&str> = health
            .components
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();
        if failing.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy: {}", failing.join(", "))),
            }
        }
    }
}
