use std::{collections::BTreeMap, fmt, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod journal;
pub mod virsh;

#[derive(Error, Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Failed to create {kind} {name}: {message}")]
    Create {
        kind: ResourceKind,
        name: String,
        message: String,
    },
    #[error("Failed to destroy {kind} {name}: {message}")]
    Destroy {
        kind: ResourceKind,
        name: String,
        message: String,
    },
    #[error("Resource journal error: {0}")]
    Journal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Pool,
    Volume,
    Network,
    Domain,
    Command,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ResourceKind::Pool => "pool",
            ResourceKind::Volume => "volume",
            ResourceKind::Network => "network",
            ResourceKind::Domain => "domain",
            ResourceKind::Command => "command",
        };
        f.write_str(kind)
    }
}

/// Result of a creation step. Later steps list the handles they depend on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl ResourceHandle {
    pub const STDOUT: &'static str = "stdout";
    pub const POOL: &'static str = "pool";
    pub const PATH: &'static str = "path";
    pub const VOLUME: &'static str = "volume";

    pub fn new(kind: ResourceKind, name: &str, id: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            id: id.to_string(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_output(mut self, key: &str, value: impl Into<String>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceArgs {
    Pool {
        name: String,
        path: PathBuf,
        xml: String,
    },
    Volume {
        name: String,
        pool: String,
        xml: String,
        source: Option<PathBuf>,
    },
    Overlay {
        name: String,
        pool: String,
        base_volume: String,
        format: String,
    },
    Network {
        name: String,
        xml: String,
    },
    Domain {
        name: String,
        xml: String,
    },
}

impl ResourceArgs {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceArgs::Pool { .. } => ResourceKind::Pool,
            ResourceArgs::Volume { .. } | ResourceArgs::Overlay { .. } => ResourceKind::Volume,
            ResourceArgs::Network { .. } => ResourceKind::Network,
            ResourceArgs::Domain { .. } => ResourceKind::Domain,
        }
    }
}

#[async_trait]
pub trait ResourceEngine {
    async fn create(
        &self,
        name: &str,
        args: ResourceArgs,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, EngineError>;
    async fn destroy(&self, handle: &ResourceHandle) -> Result<(), EngineError>;
}
