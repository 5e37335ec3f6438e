//! Shell action
//!
//! Writes the step's `run` content to a script under the working directory
//! and runs it with `sh`, streaming every output line into the execution log.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tether_core::domain::job::Step;
use tether_core::domain::result::ActionResult;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::Action;
use crate::context::ExecutionContext;
use crate::output::OutputSink;

/// Scratch directory for generated scripts, relative to the working directory
const SCRIPT_DIR: &str = ".tether-tmp";

pub struct ShellAction {
    step: String,
    run: String,
    script: Option<PathBuf>,
}

impl ShellAction {
    pub fn new(step: &Step) -> Self {
        Self {
            step: step.name.clone(),
            run: step.run.clone(),
            script: None,
        }
    }
}

/// Substitutes `${{ param.KEY }}` placeholders with job parameters
fn render(script: &str, ctx: &ExecutionContext) -> String {
    let mut rendered = script.to_string();
    for (key, value) in &ctx.parameters {
        for pattern in [
            format!("${{{{ param.{key} }}}}"),
            format!("${{{{param.{key}}}}}"),
        ] {
            rendered = rendered.replace(&pattern, value);
        }
    }
    rendered
}

fn forward_lines<R>(reader: R, output: OutputSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            output.write_line(line);
        }
    })
}

#[async_trait]
impl Action for ShellAction {
    async fn pre(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        if self.run.trim().is_empty() {
            anyhow::bail!("step `{}` has nothing to run", self.step);
        }

        let dir = ctx.workdir.join(SCRIPT_DIR);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let path = dir.join(format!("{}.sh", uuid::Uuid::new_v4()));
        let content = format!("#!/bin/sh\nset -ex\n\n{}\n", render(&self.run, ctx));
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        self.script = Some(path);
        Ok(())
    }

    async fn hook(&mut self, ctx: &mut ExecutionContext) -> Result<Option<ActionResult>> {
        let Some(script) = &self.script else {
            anyhow::bail!("script for step `{}` was not prepared", self.step);
        };

        for line in self.run.lines().filter(|l| !l.trim().is_empty()) {
            ctx.output.write_command(line);
        }

        let mut child = Command::new("sh")
            .arg(script)
            .current_dir(&ctx.workdir)
            .envs(&ctx.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn sh")?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, ctx.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, ctx.output.clone()));
        }

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for sh")?,
            _ = ctx.cancellation.cancelled() => {
                let _ = child.kill().await;
                anyhow::bail!("step `{}` cancelled", self.step);
            }
        };

        for reader in readers {
            let _ = reader.await;
        }

        if !status.success() {
            match status.code() {
                Some(code) => anyhow::bail!("script exited with status {}", code),
                None => anyhow::bail!("script terminated by signal"),
            }
        }
        Ok(None)
    }

    async fn post(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        if let Some(script) = self.script.take() {
            match fs::remove_file(&script).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(e).with_context(|| format!("Failed to remove {}", script.display()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn context(dir: &TempDir) -> ExecutionContext {
        let mut parameters = BTreeMap::new();
        parameters.insert("GREETING".to_string(), "hello".to_string());
        ExecutionContext::new(
            "build",
            1,
            dir.path().to_path_buf(),
            parameters,
            CancellationToken::new(),
            OutputSink::new(),
        )
    }

    fn step(run: &str) -> Step {
        Step {
            name: "s1".to_string(),
            uses: String::new(),
            with: BTreeMap::new(),
            run: run.to_string(),
            runs_on: None,
        }
    }

    #[test]
    fn test_render_substitutes_parameters() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        assert_eq!(
            render("echo ${{ param.GREETING }} ${{param.GREETING}} ${{ param.OTHER }}", &ctx),
            "echo hello hello ${{ param.OTHER }}"
        );
    }

    #[tokio::test]
    async fn test_runs_script_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        let mut action = ShellAction::new(&step("echo ${{ param.GREETING }} $PIPELINE_NAME"));

        action.pre(&mut ctx).await.unwrap();
        let script = action.script.clone().unwrap();
        assert!(script.exists());

        action.hook(&mut ctx).await.unwrap();
        assert!(ctx.output.content().contains("hello build"));

        action.post(&mut ctx).await.unwrap();
        assert!(!script.exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        let mut action = ShellAction::new(&step("exit 3"));

        action.pre(&mut ctx).await.unwrap();
        let err = action.hook(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("status 3"));
    }

    #[tokio::test]
    async fn test_empty_run_fails_pre() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        assert!(ShellAction::new(&step("  ")).pre(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_script() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        let mut action = ShellAction::new(&step("sleep 30"));
        action.pre(&mut ctx).await.unwrap();

        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        assert!(action.hook(&mut ctx).await.is_err());
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
