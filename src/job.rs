// 该文件是 Xunche （寻车） 项目的一部分。
// src/job.rs - 分析任务记录
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  collections::BTreeMap,
  fmt,
  path::{Path, PathBuf},
  str::FromStr,
  sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::StorageConfig;

pub mod log;
pub use self::log::{Checkpoint, JobLog, JobLogError, LogEntry};

const JOB_FILE: &str = "job.json";
const RESULT_FILE: &str = "result.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Queued,
  Processing,
  Completed,
  Failed,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Queued => "queued",
      JobStatus::Processing => "processing",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
    }
  }

  pub fn is_finished(&self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Failed)
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobStatus {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "queued" => Ok(JobStatus::Queued),
      "processing" => Ok(JobStatus::Processing),
      "completed" => Ok(JobStatus::Completed),
      "failed" => Ok(JobStatus::Failed),
      other => Err(StoreError::UnknownStatus(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
  pub id: u64,
  pub title: String,
  pub description: Option<String>,
  pub original_filename: String,
  pub storage_path: PathBuf,
  pub status: JobStatus,
  /// 0 到 100
  pub progress: u8,
  pub error_message: Option<String>,
  pub artifact_dir: Option<PathBuf>,
  pub log_path: Option<PathBuf>,
  pub duration_ms: Option<u64>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Job {
  fn new(id: u64, new: NewJob) -> Self {
    let now = Utc::now();
    Self {
      id,
      title: new.title,
      description: new.description,
      original_filename: new.original_filename,
      storage_path: PathBuf::new(),
      status: JobStatus::Queued,
      progress: 0,
      error_message: None,
      artifact_dir: None,
      log_path: None,
      duration_ms: None,
      created_at: now,
      updated_at: now,
    }
  }

  /// 同一次执行内进度只增不减
  pub fn advance(&mut self, progress: u8) {
    self.progress = self.progress.max(progress.min(100));
  }

  /// 开始新的一次执行，进度从头计
  pub fn restart(&mut self, progress: u8) {
    self.progress = progress.min(100);
  }
}

/// 创建任务时由调用方提供的信息
#[derive(Debug, Clone, Default)]
pub struct NewJob {
  pub title: String,
  pub description: Option<String>,
  pub original_filename: String,
}

/// 每个任务至多一条
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
  pub job_id: u64,
  pub summary: String,
  pub raw_json: serde_json::Value,
  pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("任务不存在: {0}")]
  NotFound(u64),
  #[error("I/O 错误 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("任务记录格式错误 {path}: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("未知的任务状态: {0}")]
  UnknownStatus(String),
  #[error("任务存储锁已失效")]
  Poisoned,
}

impl StoreError {
  fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
    move |source| StoreError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

pub trait JobStore: Send + Sync {
  /// 分配编号并保存为排队状态
  fn create_job(&self, new: NewJob) -> Result<Job, StoreError>;
  fn save_job(&self, job: &Job) -> Result<(), StoreError>;
  fn load_job(&self, id: u64) -> Result<Job, StoreError>;
  /// 按创建时间倒序
  fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
  /// 同一任务的结果只保留最新一条
  fn upsert_result(&self, result: JobResult) -> Result<(), StoreError>;
  fn load_result(&self, id: u64) -> Result<Option<JobResult>, StoreError>;

  fn update_job(&self, id: u64, apply: &mut dyn FnMut(&mut Job)) -> Result<Job, StoreError> {
    let mut job = self.load_job(id)?;
    apply(&mut job);
    job.updated_at = Utc::now();
    self.save_job(&job)?;
    Ok(job)
  }
}

#[derive(Default)]
struct MemoryInner {
  next_id: u64,
  jobs: BTreeMap<u64, Job>,
  results: BTreeMap<u64, JobResult>,
}

/// 进程内存储，用于测试和一次性运行
#[derive(Default)]
pub struct MemoryJobStore {
  inner: Mutex<MemoryInner>,
}

impl MemoryJobStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
    self.inner.lock().map_err(|_| StoreError::Poisoned)
  }
}

impl JobStore for MemoryJobStore {
  fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
    let mut inner = self.lock()?;
    inner.next_id += 1;
    let job = Job::new(inner.next_id, new);
    inner.jobs.insert(job.id, job.clone());
    Ok(job)
  }

  fn save_job(&self, job: &Job) -> Result<(), StoreError> {
    self.lock()?.jobs.insert(job.id, job.clone());
    Ok(())
  }

  fn load_job(&self, id: u64) -> Result<Job, StoreError> {
    self.lock()?.jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))
  }

  fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
    let mut jobs: Vec<Job> = self.lock()?.jobs.values().cloned().collect();
    sort_newest_first(&mut jobs);
    Ok(jobs)
  }

  fn upsert_result(&self, result: JobResult) -> Result<(), StoreError> {
    let mut inner = self.lock()?;
    if !inner.jobs.contains_key(&result.job_id) {
      return Err(StoreError::NotFound(result.job_id));
    }
    inner.results.insert(result.job_id, result);
    Ok(())
  }

  fn load_result(&self, id: u64) -> Result<Option<JobResult>, StoreError> {
    Ok(self.lock()?.results.get(&id).cloned())
  }
}

/// 以目录保存任务：`<storage_dir>/<id>/job.json` 与 `result.json`
pub struct DirectoryJobStore {
  storage: StorageConfig,
  allocate: Mutex<()>,
}

impl DirectoryJobStore {
  pub fn new(storage: StorageConfig) -> Self {
    Self {
      storage,
      allocate: Mutex::new(()),
    }
  }

  pub fn storage(&self) -> &StorageConfig {
    &self.storage
  }

  fn job_ids(&self) -> Result<Vec<u64>, StoreError> {
    let root = &self.storage.storage_dir;
    if !root.is_dir() {
      return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(root).map_err(StoreError::io(root))? {
      let entry = entry.map_err(StoreError::io(root))?;
      if let Some(id) = entry.file_name().to_str().and_then(|name| name.parse::<u64>().ok())
        && entry.path().join(JOB_FILE).is_file()
      {
        ids.push(id);
      }
    }
    Ok(ids)
  }

  fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
    let text = std::fs::read_to_string(path).map_err(StoreError::io(path))?;
    serde_json::from_str(&text).map_err(|source| StoreError::Json {
      path: path.to_path_buf(),
      source,
    })
  }

  /// 先写临时文件再改名，读者不会看到写了一半的记录
  fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(StoreError::io(parent))?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
      path: path.to_path_buf(),
      source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text).map_err(StoreError::io(&tmp))?;
    std::fs::rename(&tmp, path).map_err(StoreError::io(path))
  }
}

impl JobStore for DirectoryJobStore {
  fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
    let _guard = self.allocate.lock().map_err(|_| StoreError::Poisoned)?;
    let id = self.job_ids()?.into_iter().max().unwrap_or(0) + 1;
    let job = Job::new(id, new);
    Self::write_json(&self.storage.job_dir(id).join(JOB_FILE), &job)?;
    debug!("创建任务 {}", id);
    Ok(job)
  }

  fn save_job(&self, job: &Job) -> Result<(), StoreError> {
    Self::write_json(&self.storage.job_dir(job.id).join(JOB_FILE), job)
  }

  fn load_job(&self, id: u64) -> Result<Job, StoreError> {
    let path = self.storage.job_dir(id).join(JOB_FILE);
    if !path.is_file() {
      return Err(StoreError::NotFound(id));
    }
    Self::read_json(&path)
  }

  fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
    let mut jobs = self
      .job_ids()?
      .into_iter()
      .map(|id| self.load_job(id))
      .collect::<Result<Vec<_>, _>>()?;
    sort_newest_first(&mut jobs);
    Ok(jobs)
  }

  fn upsert_result(&self, result: JobResult) -> Result<(), StoreError> {
    let dir = self.storage.job_dir(result.job_id);
    if !dir.join(JOB_FILE).is_file() {
      return Err(StoreError::NotFound(result.job_id));
    }
    Self::write_json(&dir.join(RESULT_FILE), &result)
  }

  fn load_result(&self, id: u64) -> Result<Option<JobResult>, StoreError> {
    let path = self.storage.job_dir(id).join(RESULT_FILE);
    if !path.is_file() {
      return Ok(None);
    }
    Self::read_json(&path).map(Some)
  }
}

fn sort_newest_first(jobs: &mut [Job]) {
  jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[cfg(test)]
mod tests {
  use super::*;

  fn new_job(title: &str) -> NewJob {
    NewJob {
      title: title.to_string(),
      description: None,
      original_filename: format!("{}.mp4", title),
    }
  }

  fn result(job_id: u64, summary: &str) -> JobResult {
    JobResult {
      job_id,
      summary: summary.to_string(),
      raw_json: serde_json::json!({ "summary": summary }),
      created_at: Utc::now(),
    }
  }

  fn exercise_store(store: &dyn JobStore) {
    let first = store.create_job(new_job("first")).unwrap();
    let second = store.create_job(new_job("second")).unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.status, JobStatus::Queued);
    assert_eq!(first.progress, 0);

    let updated = store
      .update_job(first.id, &mut |job: &mut Job| {
        job.status = JobStatus::Processing;
        job.advance(30);
      })
      .unwrap();
    assert_eq!(updated.progress, 30);
    assert_eq!(store.load_job(first.id).unwrap().status, JobStatus::Processing);

    assert!(store.load_result(first.id).unwrap().is_none());
    store.upsert_result(result(first.id, "one")).unwrap();
    store.upsert_result(result(first.id, "two")).unwrap();
    assert_eq!(store.load_result(first.id).unwrap().unwrap().summary, "two");

    assert!(matches!(
      store.upsert_result(result(999, "ghost")),
      Err(StoreError::NotFound(999))
    ));
    assert!(matches!(store.load_job(999), Err(StoreError::NotFound(999))));

    let listed: Vec<u64> = store.list_jobs().unwrap().iter().map(|j| j.id).collect();
    assert_eq!(listed, [second.id, first.id]);
  }

  #[test]
  fn memory_store_lifecycle() {
    exercise_store(&MemoryJobStore::new());
  }

  #[test]
  fn directory_store_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirectoryJobStore::new(StorageConfig::new(dir.path().join("videos"), dir.path().join("logs")));
    exercise_store(&store);
    assert!(dir.path().join("videos/1/result.json").is_file());
  }

  #[test]
  fn directory_store_continues_numbering() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig::new(dir.path(), dir.path().join("logs"));
    let first = DirectoryJobStore::new(storage.clone()).create_job(new_job("a")).unwrap();
    let second = DirectoryJobStore::new(storage).create_job(new_job("b")).unwrap();
    assert_eq!(second.id, first.id + 1);
  }

  #[test]
  fn progress_never_decreases() {
    let mut job = Job::new(1, new_job("a"));
    job.advance(30);
    job.advance(10);
    assert_eq!(job.progress, 30);
    job.advance(250);
    assert_eq!(job.progress, 100);
    job.restart(10);
    assert_eq!(job.progress, 10);
  }

  #[test]
  fn status_round_trips_through_text() {
    assert_eq!("Completed".parse::<JobStatus>().unwrap(), JobStatus::Completed);
    assert_eq!(serde_json::to_string(&JobStatus::Failed).unwrap(), "\"failed\"");
    assert!("paused".parse::<JobStatus>().is_err());
  }
}
