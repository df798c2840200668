//! Factory library for logical machine slots
//!
//! This crate provides the core functionality for:
//! - Slot lifecycle over VM, Docker and Singularity backends
//! - Disk, network and cgroup provisioning
//! - Zombie reaping against on-disk slot records
//! - The UDP status protocol between peer factories
//! - Health checks and observability

pub mod allocator;
pub mod backend;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod error;
pub mod health;
pub mod images;
pub mod models;
pub mod observability;
pub mod protocol;
pub mod provision;
pub mod reaper;
pub mod slots;
pub mod store;

pub use config::{ConfigHandle, ConfigSnapshot, FactoryConfig, InstanceType};
pub use cycle::{ControlCycle, CycleConfig, CycleReport};
pub use error::{FactoryError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{FactoryMetrics, StructuredLogger};
pub use slots::SlotManager;
