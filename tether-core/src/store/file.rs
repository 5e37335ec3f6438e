//! Filesystem-backed job store
//!
//! Layout under the store root:
//!
//! ```text
//! jobs/<name>/job.yml
//! jobs/<name>/details/<id>.json
//! jobs/<name>/logs/<id>.log
//! jobs/<name>/artifacts/<id>/...
//! jobs/<name>/reports/<id>/...
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use super::{DetailUpdate, JobStore, Result, StoreError};
use crate::domain::detail::JobDetail;
use crate::domain::job::{DefinitionError, Job};
use crate::dto::message::{FileChunk, FileKind};
use crate::resolver;

pub struct FileJobStore {
    root: PathBuf,
    /// Serializes execution id allocation
    id_lock: Mutex<()>,
    /// Serializes detail read-modify-write cycles
    detail_lock: Mutex<()>,
    log_lock: Mutex<()>,
}

impl FileJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            id_lock: Mutex::new(()),
            detail_lock: Mutex::new(()),
            log_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    fn job_dir(&self, name: &str) -> PathBuf {
        self.jobs_dir().join(name)
    }

    fn job_file(&self, name: &str) -> PathBuf {
        self.job_dir(name).join("job.yml")
    }

    fn details_dir(&self, name: &str) -> PathBuf {
        self.job_dir(name).join("details")
    }

    fn detail_file(&self, name: &str, id: u64) -> PathBuf {
        self.details_dir(name).join(format!("{id}.json"))
    }

    fn log_file(&self, name: &str, id: u64) -> PathBuf {
        self.job_dir(name).join("logs").join(format!("{id}.log"))
    }

    async fn detail_ids(&self, name: &str) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(self.details_dir(name)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    async fn write_job_source(&self, name: &str, source: &str) -> Result<()> {
        write_atomic(&self.job_file(name), source.as_bytes()).await
    }

    /// Caller must hold `detail_lock`
    async fn write_detail(&self, detail: &JobDetail) -> Result<()> {
        check_name(&detail.name)?;
        let json = serde_json::to_vec_pretty(detail)?;
        write_atomic(&self.detail_file(&detail.name, detail.id), &json).await
    }

    fn kind_dir(&self, name: &str, id: u64, kind: FileKind) -> PathBuf {
        match kind {
            FileKind::Artifact => self.artifact_dir(name, id),
            FileKind::Report => self.report_dir(name, id),
        }
    }
}

/// Job names become directory names
fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StoreError::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// Rejects absolute paths and parent traversal
fn check_relative(path: &str) -> Result<&Path> {
    let candidate = Path::new(path);
    let safe = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(candidate)
}

/// Writes through a temp file unique to this call, then renames it in place
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    if let Err(e) = fs::write(&tmp, data).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Lists every regular file below `dir`
async fn walk_files(dir: PathBuf) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create_job(&self, source: &str) -> Result<Job> {
        let job = Job::from_yaml(source)?;
        check_name(&job.name)?;

        if fs::try_exists(self.job_file(&job.name)).await? {
            return Err(StoreError::JobExists(job.name));
        }

        self.write_job_source(&job.name, source).await?;
        tracing::info!("Job created: {}", job.name);
        Ok(job)
    }

    async fn update_job(&self, old_name: &str, source: &str) -> Result<Job> {
        let job = Job::from_yaml(source)?;
        check_name(&job.name)?;

        if !fs::try_exists(self.job_file(old_name)).await? {
            return Err(StoreError::JobNotFound(old_name.to_string()));
        }

        if job.name != old_name {
            if fs::try_exists(self.job_dir(&job.name)).await? {
                return Err(StoreError::JobExists(job.name));
            }
            fs::rename(self.job_dir(old_name), self.job_dir(&job.name)).await?;

            // History moves with the job
            for mut detail in self.list_job_details(&job.name).await? {
                detail.name = job.name.clone();
                self.save_job_detail(&detail).await?;
            }
            tracing::info!("Job renamed: {} -> {}", old_name, job.name);
        }

        self.write_job_source(&job.name, source).await?;
        Ok(job)
    }

    async fn get_job(&self, name: &str) -> Result<Job> {
        let source = self.get_job_source(name).await?;
        Ok(Job::parse(&source)?)
    }

    async fn get_job_source(&self, name: &str) -> Result<String> {
        check_name(name)?;
        match fs::read_to_string(self.job_file(name)).await {
            Ok(source) => Ok(source),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::JobNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        check_name(name)?;
        match fs::remove_dir_all(self.job_dir(name)).await {
            Ok(()) => {
                tracing::info!("Job deleted: {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::JobNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut entries = match fs::read_dir(self.jobs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(jobs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            match self.get_job(&name).await {
                Ok(job) => jobs.push(job),
                Err(StoreError::JobNotFound(_)) => {}
                Err(e) => tracing::warn!("Skipping unreadable job {}: {}", name, e),
            }
        }

        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn save_job_params(&self, name: &str, params: BTreeMap<String, String>) -> Result<Job> {
        let mut job = self.get_job(name).await?;
        job.parameter = params;
        self.write_job_source(name, &job.to_yaml()?).await?;
        Ok(job)
    }

    async fn create_job_detail(&self, name: &str) -> Result<JobDetail> {
        let job = self.get_job(name).await?;
        let stages = resolver::resolve(&job.stages).map_err(DefinitionError::from)?;

        let _guard = self.id_lock.lock().await;
        let id = self.detail_ids(name).await?.into_iter().max().unwrap_or(0) + 1;
        let detail = JobDetail::new(id, &job, stages);
        self.save_job_detail(&detail).await?;

        tracing::debug!("Execution created: {}/{}", name, id);
        Ok(detail)
    }

    async fn save_job_detail(&self, detail: &JobDetail) -> Result<()> {
        let _guard = self.detail_lock.lock().await;
        self.write_detail(detail).await
    }

    async fn update_job_detail(
        &self,
        name: &str,
        id: u64,
        update: DetailUpdate<'_>,
    ) -> Result<(JobDetail, bool)> {
        let _guard = self.detail_lock.lock().await;
        let mut detail = self.get_job_detail(name, id).await?;
        let changed = update(&mut detail);
        if changed {
            self.write_detail(&detail).await?;
        }
        Ok((detail, changed))
    }

    async fn get_job_detail(&self, name: &str, id: u64) -> Result<JobDetail> {
        check_name(name)?;
        match fs::read(self.detail_file(name, id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::DetailNotFound {
                name: name.to_string(),
                id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_job_details(&self, name: &str) -> Result<Vec<JobDetail>> {
        check_name(name)?;
        let mut ids = self.detail_ids(name).await?;
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut details = Vec::with_capacity(ids.len());
        for id in ids {
            details.push(self.get_job_detail(name, id).await?);
        }
        Ok(details)
    }

    async fn delete_job_detail(&self, name: &str, id: u64) -> Result<()> {
        check_name(name)?;
        match fs::remove_file(self.detail_file(name, id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::DetailNotFound {
                    name: name.to_string(),
                    id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        match fs::remove_file(self.log_file(name, id)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        remove_dir_if_exists(&self.artifact_dir(name, id)).await?;
        remove_dir_if_exists(&self.report_dir(name, id)).await?;
        Ok(())
    }

    async fn mark_stopped(&self, name: &str, id: u64, reason: &str) -> Result<JobDetail> {
        let (detail, _) = self
            .update_job_detail(
                name,
                id,
                Box::new(|detail: &mut JobDetail| detail.stop(reason)),
            )
            .await?;
        Ok(detail)
    }

    async fn save_log(&self, name: &str, id: u64, content: &str) -> Result<()> {
        check_name(name)?;
        write_atomic(&self.log_file(name, id), content.as_bytes()).await
    }

    async fn append_log(&self, name: &str, id: u64, offset: usize, chunk: &str) -> Result<()> {
        let _guard = self.log_lock.lock().await;
        let existing = self.get_log(name, id).await?;
        let mut content = String::with_capacity(existing.len() + chunk.len());
        for line in existing.lines().take(offset) {
            content.push_str(line);
            content.push('\n');
        }
        content.push_str(chunk);
        self.save_log(name, id, &content).await
    }

    async fn get_log(&self, name: &str, id: u64) -> Result<String> {
        check_name(name)?;
        match fs::read_to_string(self.log_file(name, id)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_file(&self, file: &FileChunk) -> Result<()> {
        check_name(&file.job_name)?;
        let relative = check_relative(&file.path)?;
        let dir = self.kind_dir(&file.job_name, file.job_id, file.kind);
        write_atomic(&dir.join(relative), &file.data).await
    }

    async fn collect_files(&self, name: &str, id: u64) -> Result<Vec<FileChunk>> {
        check_name(name)?;
        let mut chunks = Vec::new();
        for kind in [FileKind::Artifact, FileKind::Report] {
            let dir = self.kind_dir(name, id, kind);
            for path in walk_files(dir.clone()).await? {
                let Ok(relative) = path.strip_prefix(&dir) else {
                    continue;
                };
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                chunks.push(FileChunk {
                    job_name: name.to_string(),
                    job_id: id,
                    kind,
                    path: relative,
                    data: fs::read(&path).await?,
                });
            }
        }
        Ok(chunks)
    }

    fn artifact_dir(&self, name: &str, id: u64) -> PathBuf {
        self.job_dir(name).join("artifacts").join(id.to_string())
    }

    fn report_dir(&self, name: &str, id: u64) -> PathBuf {
        self.job_dir(name).join("reports").join(id.to_string())
    }
}
