//! Action results accumulated into a job execution

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A build output published by an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub url: String,
}

/// A check report produced by an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

/// An endpoint an action deployed to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deploy {
    #[serde(default)]
    pub id: String,
    pub url: String,
}

/// What an action's hook hands back to the executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<Report>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deploys: Vec<Deploy>,

    /// Free-form build metadata, one map per producing step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_data: Vec<BTreeMap<String, String>>,

    /// Source revision information, e.g. a commit id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_info: Option<String>,
}

impl ActionResult {
    /// Appends everything from `other`; existing entries are never replaced
    pub fn merge(&mut self, other: ActionResult) {
        self.artifacts.extend(other.artifacts);
        self.reports.extend(other.reports);
        self.deploys.extend(other.deploys);
        self.build_data.extend(other.build_data);
        if self.code_info.is_none() {
            self.code_info = other.code_info;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
            && self.reports.is_empty()
            && self.deploys.is_empty()
            && self.build_data.is_empty()
            && self.code_info.is_none()
    }
}
