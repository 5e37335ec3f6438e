//! Workdir action
//!
//! Moves the execution's working directory to `with.workdir`, expanding
//! `$VAR` references from the context environment and creating the
//! directory when missing.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tether_core::domain::job::Step;
use tether_core::domain::result::ActionResult;
use tokio::fs;

use super::Action;
use crate::context::ExecutionContext;

pub struct WorkdirAction {
    workdir: String,
}

impl WorkdirAction {
    pub fn new(step: &Step) -> Self {
        Self {
            workdir: step.with.get("workdir").cloned().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Action for WorkdirAction {
    async fn pre(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        if self.workdir.trim().is_empty() {
            anyhow::bail!("workdir action needs `with.workdir`");
        }
        Ok(())
    }

    async fn hook(&mut self, ctx: &mut ExecutionContext) -> Result<Option<ActionResult>> {
        let expanded = PathBuf::from(ctx.expand(&self.workdir));
        let workdir = if expanded.is_absolute() {
            expanded
        } else {
            ctx.workdir.join(expanded)
        };

        fs::create_dir_all(&workdir)
            .await
            .with_context(|| format!("Failed to create {}", workdir.display()))?;

        ctx.output
            .write_line(format!("Working directory: {}", workdir.display()));
        ctx.workdir = workdir;
        Ok(None)
    }

    async fn post(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use crate::output::OutputSink;

    #[tokio::test]
    async fn test_moves_and_creates_workdir() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ExecutionContext::new(
            "build",
            3,
            dir.path().to_path_buf(),
            BTreeMap::new(),
            CancellationToken::new(),
            OutputSink::new(),
        );

        let mut with = BTreeMap::new();
        with.insert("workdir".to_string(), "src/$PIPELINE_ID".to_string());
        let mut action = WorkdirAction::new(&Step {
            name: "cd".to_string(),
            uses: "workdir".to_string(),
            with,
            run: String::new(),
            runs_on: None,
        });

        action.pre(&mut ctx).await.unwrap();
        action.hook(&mut ctx).await.unwrap();

        assert_eq!(ctx.workdir, dir.path().join("src/3"));
        assert!(ctx.workdir.is_dir());
    }
}
