//! Error taxonomy for the factory core
//!
//! Provisioning and backend failures are recoverable per slot, protocol
//! failures are swallowed at the protocol boundary and configuration
//! failures only abort the creation attempt that hit them.

use crate::models::BackendModel;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the core
pub type Result<T> = std::result::Result<T, FactoryError>;

#[derive(Debug, Error)]
pub enum FactoryError {
    /// Disk, volume, cgroup or network provisioning failed
    #[error("resource provisioning failed at {step}: {message}")]
    Resource { step: &'static str, message: String },

    /// The execution backend rejected or lost the instance
    #[error("{model} backend error: {message}")]
    Backend { model: BackendModel, message: String },

    /// Malformed or unauthenticated protocol message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unresolvable instance type, backend model or invalid setting
    #[error("configuration error: {0}")]
    Config(String),

    /// The slot is not idle and cannot take a new instance
    #[error("slot {0} is busy")]
    SlotBusy(String),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FactoryError {
    pub fn resource(step: &'static str, message: impl Into<String>) -> Self {
        Self::Resource {
            step,
            message: message.into(),
        }
    }

    pub fn backend(model: BackendModel, message: impl Into<String>) -> Self {
        Self::Backend {
            model,
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable category name, used for metric labels
    pub fn category(&self) -> &'static str {
        match self {
            Self::Resource { .. } => "resource",
            Self::Backend { .. } => "backend",
            Self::Protocol(_) => "protocol",
            Self::Config(_) => "config",
            Self::SlotBusy(_) => "busy",
            Self::Io { .. } | Self::Json(_) => "io",
        }
    }
}
