//! Job persistence
//!
//! The `JobStore` trait covers everything master and workers persist: job
//! definitions, execution details, logs and produced files. `FileJobStore`
//! keeps them on the local filesystem.

mod file;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::detail::JobDetail;
use crate::domain::job::{DefinitionError, Job};
use crate::dto::job::Page;
use crate::dto::message::FileChunk;

pub use file::FileJobStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job `{0}` not found")]
    JobNotFound(String),

    #[error("job `{0}` already exists")]
    JobExists(String),

    #[error("execution {name}/{id} not found")]
    DetailNotFound { name: String, id: u64 },

    #[error("invalid path `{0}`")]
    InvalidPath(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Edits a stored detail in place; returns whether anything changed
pub type DetailUpdate<'a> = Box<dyn FnOnce(&mut JobDetail) -> bool + Send + 'a>;

/// Persistence for jobs and their executions
#[async_trait]
pub trait JobStore: Send + Sync {
    // -------------------------------------------------------------------------
    // Definitions
    // -------------------------------------------------------------------------

    /// Stores a new job; the source must parse and resolve
    async fn create_job(&self, source: &str) -> Result<Job>;

    /// Replaces a job definition, moving its history if the name changed
    async fn update_job(&self, old_name: &str, source: &str) -> Result<Job>;

    async fn get_job(&self, name: &str) -> Result<Job>;

    /// The job definition exactly as stored
    async fn get_job_source(&self, name: &str) -> Result<String>;

    /// Removes a job together with its whole history
    async fn delete_job(&self, name: &str) -> Result<()>;

    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Jobs whose name contains `keyword`, one page at a time
    async fn search_jobs(
        &self,
        keyword: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Page<Job>> {
        let jobs = self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|job| job.name.contains(keyword))
            .collect();
        Ok(Page::slice(jobs, page, page_size))
    }

    /// Overwrites the job's parameter map
    async fn save_job_params(&self, name: &str, params: BTreeMap<String, String>) -> Result<Job>;

    // -------------------------------------------------------------------------
    // Executions
    // -------------------------------------------------------------------------

    /// Allocates the next execution id and stores a NOTRUN detail for it
    async fn create_job_detail(&self, name: &str) -> Result<JobDetail>;

    async fn save_job_detail(&self, detail: &JobDetail) -> Result<()>;

    /// Loads a detail, applies `update` and saves it if it reports a change.
    /// Concurrent updates of the same store never interleave.
    async fn update_job_detail(
        &self,
        name: &str,
        id: u64,
        update: DetailUpdate<'_>,
    ) -> Result<(JobDetail, bool)>;

    async fn get_job_detail(&self, name: &str, id: u64) -> Result<JobDetail>;

    /// All executions of a job, newest first
    async fn list_job_details(&self, name: &str) -> Result<Vec<JobDetail>>;

    /// One page of a job's executions, newest first
    async fn list_job_details_page(
        &self,
        name: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Page<JobDetail>> {
        let details = self.list_job_details(name).await?;
        Ok(Page::slice(details, page, page_size))
    }

    /// Removes one execution with its log and files
    async fn delete_job_detail(&self, name: &str, id: u64) -> Result<()>;

    /// Stops a non-terminal execution and persists it
    async fn mark_stopped(&self, name: &str, id: u64, reason: &str) -> Result<JobDetail>;

    // -------------------------------------------------------------------------
    // Logs and files
    // -------------------------------------------------------------------------

    /// Replaces the execution log
    async fn save_log(&self, name: &str, id: u64, content: &str) -> Result<()>;

    /// Writes `chunk` after the first `offset` lines, dropping anything beyond
    async fn append_log(&self, name: &str, id: u64, offset: usize, chunk: &str) -> Result<()>;

    /// The execution log, empty if nothing was written yet
    async fn get_log(&self, name: &str, id: u64) -> Result<String>;

    /// Stores a file below the execution's artifact or report directory
    async fn save_file(&self, file: &FileChunk) -> Result<()>;

    /// Every artifact and report file of an execution
    async fn collect_files(&self, name: &str, id: u64) -> Result<Vec<FileChunk>>;

    /// Directory actions write build outputs into
    fn artifact_dir(&self, name: &str, id: u64) -> PathBuf;

    /// Directory actions write check reports into
    fn report_dir(&self, name: &str, id: u64) -> PathBuf;
}
