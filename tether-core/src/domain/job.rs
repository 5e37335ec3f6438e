//! Job definition types
//!
//! A job is a YAML document:
//!
//! ```yaml
//! version: "1"
//! name: build
//! parameter:
//!   branch: main
//! stages:
//!   checkout:
//!     steps:
//!       - name: clone
//!         run: git clone ...
//!   test:
//!     needs: [checkout]
//!     steps:
//!       - name: unit
//!         uses: shell
//!         run: cargo test
//! ```
//!
//! Stage declaration order is significant: the resolver uses it to break ties,
//! so `Stages` keeps entries in document order instead of hashing them.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::resolver::{self, ResolveError};

/// Errors raised while loading a job definition
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("malformed job document: {0}")]
    Malformed(#[from] serde_yaml::Error),

    #[error("job name cannot be empty")]
    MissingName,

    #[error("job `{0}` declares no stages")]
    NoStages(String),

    #[error("stage `{stage}` has a step without a name")]
    UnnamedStep { stage: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Declarative job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub version: String,

    pub name: String,

    /// Free-form parameters, exposed to steps as environment variables
    #[serde(default)]
    pub parameter: BTreeMap<String, String>,

    pub stages: Stages,
}

impl Job {
    /// Parses a job from YAML without validating its stage graph
    pub fn parse(source: &str) -> Result<Self, DefinitionError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Parses and validates a job; fails on any definition error
    pub fn from_yaml(source: &str) -> Result<Self, DefinitionError> {
        let job = Self::parse(source)?;
        job.validate()?;
        Ok(job)
    }

    pub fn to_yaml(&self) -> Result<String, DefinitionError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Checks names and resolves the stage graph
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::MissingName);
        }

        if self.stages.is_empty() {
            return Err(DefinitionError::NoStages(self.name.clone()));
        }

        for (stage_name, stage) in self.stages.iter() {
            if stage.steps.iter().any(|step| step.name.trim().is_empty()) {
                return Err(DefinitionError::UnnamedStep {
                    stage: stage_name.clone(),
                });
            }
        }

        resolver::resolve(&self.stages)?;
        Ok(())
    }
}

/// A named group of steps with its prerequisite stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One executable action invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    /// Action type identifier; empty selects the shell action
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uses: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,

    /// Inline shell content
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run: String,

    /// Execution environment to materialize before the action runs
    #[serde(default, rename = "runs-on", skip_serializing_if = "Option::is_none")]
    pub runs_on: Option<String>,
}

// =============================================================================
// Ordered stage map
// =============================================================================

/// Stage name to stage mapping that preserves declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stages(Vec<(String, Stage)>);

impl Stages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage; returns false if the name is already taken
    pub fn insert(&mut self, name: impl Into<String>, stage: Stage) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.0.push((name, stage));
        true
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Stage)> {
        self.0.iter().map(|(n, s)| (n, s))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Stage)> for Stages {
    fn from_iter<I: IntoIterator<Item = (String, Stage)>>(iter: I) -> Self {
        let mut stages = Stages::new();
        for (name, stage) in iter {
            stages.insert(name, stage);
        }
        stages
    }
}

impl Serialize for Stages {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(n, s)| (n, s)))
    }
}

impl<'de> Deserialize<'de> for Stages {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StagesVisitor;

        impl<'de> Visitor<'de> for StagesVisitor {
            type Value = Stages;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of stage name to stage")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Stages, A::Error> {
                let mut stages = Stages::new();
                while let Some((name, stage)) = map.next_entry::<String, Stage>()? {
                    if stages.contains(&name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate stage `{name}`"
                        )));
                    }
                    stages.insert(name, stage);
                }
                Ok(stages)
            }
        }

        deserializer.deserialize_map(StagesVisitor)
    }
}
