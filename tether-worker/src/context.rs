//! Execution context for running jobs
//!
//! Contains all state the actions of one execution share:
//! - Working directory and environment variables
//! - Job parameters
//! - The cancellation signal
//! - The output sink
//! - Where artifacts and reports are collected

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::output::OutputSink;

/// Execution context shared by every step of one execution
pub struct ExecutionContext {
    pub job_name: String,
    pub job_id: u64,

    /// Directory commands run in; actions may move it
    pub workdir: PathBuf,

    /// Variables exported to commands
    pub env: BTreeMap<String, String>,

    /// Job parameters, also exported through `env`
    pub parameters: BTreeMap<String, String>,

    /// Fires on cancel and on step timeout
    pub cancellation: CancellationToken,

    pub output: OutputSink,

    pub artifact_dir: PathBuf,
    pub report_dir: PathBuf,
}

impl ExecutionContext {
    pub fn new(
        job_name: &str,
        job_id: u64,
        workdir: PathBuf,
        parameters: BTreeMap<String, String>,
        cancellation: CancellationToken,
        output: OutputSink,
    ) -> Self {
        let mut env = parameters.clone();
        env.insert("PIPELINE_NAME".to_string(), job_name.to_string());
        env.insert("PIPELINE_ID".to_string(), job_id.to_string());

        Self {
            job_name: job_name.to_string(),
            job_id,
            workdir,
            env,
            parameters,
            cancellation,
            output,
            artifact_dir: PathBuf::new(),
            report_dir: PathBuf::new(),
        }
    }

    /// Sets where produced files are collected
    pub fn with_file_dirs(mut self, artifact_dir: PathBuf, report_dir: PathBuf) -> Self {
        self.artifact_dir = artifact_dir;
        self.report_dir = report_dir;
        self
    }

    /// Replaces `$NAME` references with values from `env`
    ///
    /// Longer names are substituted first so `$PIPELINE_ID` is not clobbered
    /// by a shorter `$PIPELINE` variable.
    pub fn expand(&self, text: &str) -> String {
        let mut names: Vec<&String> = self.env.keys().collect();
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));

        let mut expanded = text.to_string();
        for name in names {
            let pattern = format!("${name}");
            if expanded.contains(&pattern) {
                expanded = expanded.replace(&pattern, &self.env[name]);
            }
        }
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        let mut parameters = BTreeMap::new();
        parameters.insert("BRANCH".to_string(), "main".to_string());
        ExecutionContext::new(
            "build",
            7,
            PathBuf::from("/tmp/build"),
            parameters,
            CancellationToken::new(),
            OutputSink::new(),
        )
    }

    #[test]
    fn test_pipeline_variables_are_exported() {
        let ctx = context();
        assert_eq!(ctx.env["PIPELINE_NAME"], "build");
        assert_eq!(ctx.env["PIPELINE_ID"], "7");
        assert_eq!(ctx.env["BRANCH"], "main");
    }

    #[test]
    fn test_expand_prefers_longest_name() {
        let mut ctx = context();
        ctx.env.insert("PIPELINE".to_string(), "x".to_string());
        assert_eq!(
            ctx.expand("/work/$PIPELINE_NAME/$PIPELINE_ID/$BRANCH"),
            "/work/build/7/main"
        );
    }
}
