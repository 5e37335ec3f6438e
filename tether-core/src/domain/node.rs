//! Node domain model
//!
//! Represents a worker process that executes jobs dispatched by the master.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker identity: logical name plus network address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Registry key, `name@address`
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.address)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// A registered node as reported by the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub key: String,
    pub name: String,
    pub address: String,

    /// When this node registered
    pub registered_at: DateTime<Utc>,

    /// Last time this node sent a heartbeat
    pub last_ping_at: DateTime<Utc>,
}
