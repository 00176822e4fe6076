// 该文件是 Xunche （寻车） 项目的一部分。
// src/task.rs - 分析任务的提交、执行与后台队列
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

//! 一个任务的生命周期：
//!
//! ```text
//! submit: 分配编号 -> 保存上传 -> 重置日志 -> upload_saved -> queued
//! process: job_received -> model_loading -> model_completed -> job_completed
//!                                        \-> model_failed    -> job_failed
//! ```
//!
//! 进入 `processing` 之后任何一步出错，都会记录 `model_failed` 与 `job_failed` 并把任务标为失败。
//!
//! [`JobQueue`] 用固定数量的后台线程消费任务编号。没有取消操作，已经开始的任务总会运行到结束。

use std::{
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex,
    mpsc::{self, Receiver, Sender},
  },
  thread::{self, JoinHandle},
  time::Instant,
};

use chrono::Utc;
use image::RgbImage;
use ndarray::Array2;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  config::StorageConfig,
  job::{Checkpoint, Job, JobLog, JobLogError, JobResult, JobStatus, JobStore, NewJob, StoreError},
  model::{ExtractError, FrameDetector, Model},
  runner::{ModelRunner, RunError, RunResult},
};

/// 上传文件没有扩展名时使用
const DEFAULT_EXTENSION: &str = "mp4";

const PROGRESS_RECEIVED: u8 = 10;
const PROGRESS_MODEL_LOADING: u8 = 30;
const PROGRESS_DONE: u8 = 100;

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("上传内容不存在: {0}")]
  UploadNotFound(PathBuf),
  #[error("任务存储错误: {0}")]
  Store(#[from] StoreError),
  #[error("任务日志错误: {0}")]
  Log(#[from] JobLogError),
  #[error("结果序列化错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("I/O 错误 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error(transparent)]
  Run(#[from] RunError),
  #[error("任务队列已关闭")]
  QueueClosed,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TaskError + '_ {
  move |source| TaskError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// 把分析器、任务存储与目录布局组合在一起，进程内共享一份
pub struct AnalysisTask<D, E> {
  runner: Arc<ModelRunner<D, E>>,
  store: Arc<dyn JobStore>,
  storage: StorageConfig,
}

impl<D, E> AnalysisTask<D, E>
where
  D: FrameDetector,
  D::Error: std::fmt::Display,
  E: Model<Input = [RgbImage], Output = Array2<f32>, Error = ExtractError>,
{
  pub fn new(runner: Arc<ModelRunner<D, E>>, store: Arc<dyn JobStore>, storage: StorageConfig) -> Self {
    Self {
      runner,
      store,
      storage,
    }
  }

  pub fn store(&self) -> &dyn JobStore {
    self.store.as_ref()
  }

  pub fn storage(&self) -> &StorageConfig {
    &self.storage
  }

  pub fn job_log(&self, id: u64) -> JobLog {
    JobLog::new(self.storage.log_path(id))
  }

  /// 保存上传内容并登记为排队任务；文件保存为 `source.<ext>`，目录按图像序列复制
  pub fn submit(&self, upload: &Path, mut new: NewJob) -> Result<Job, TaskError> {
    if !upload.exists() {
      return Err(TaskError::UploadNotFound(upload.to_path_buf()));
    }
    if new.original_filename.is_empty() {
      new.original_filename = upload
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    }
    if new.title.is_empty() {
      new.title = new.original_filename.clone();
    }

    let mut job = self.store.create_job(new)?;
    let (storage_path, bytes) = self.save_upload(job.id, upload)?;

    let log = self.job_log(job.id);
    log.reset()?;
    log.checkpoint(
      Checkpoint::UploadSaved,
      json!({ "bytes": bytes, "path": storage_path.display().to_string() }),
    )?;

    job.storage_path = storage_path;
    job.artifact_dir = Some(self.storage.artifact_dir(job.id));
    job.log_path = Some(log.path().to_path_buf());
    job.status = JobStatus::Queued;
    job.updated_at = Utc::now();
    self.store.save_job(&job)?;

    info!("任务 {} 已提交: {} ({} 字节)", job.id, job.original_filename, bytes);
    Ok(job)
  }

  fn save_upload(&self, id: u64, upload: &Path) -> Result<(PathBuf, u64), TaskError> {
    let job_dir = self.storage.job_dir(id);
    std::fs::create_dir_all(&job_dir).map_err(io_error(&job_dir))?;

    if upload.is_dir() {
      let target = job_dir.join("source");
      std::fs::create_dir_all(&target).map_err(io_error(&target))?;
      let mut bytes = 0;
      for entry in std::fs::read_dir(upload).map_err(io_error(upload))? {
        let path = entry.map_err(io_error(upload))?.path();
        if let Some(name) = path.file_name()
          && path.is_file()
        {
          bytes += std::fs::copy(&path, target.join(name)).map_err(io_error(&path))?;
        }
      }
      return Ok((target, bytes));
    }

    let extension = upload
      .extension()
      .and_then(|ext| ext.to_str())
      .filter(|ext| !ext.is_empty())
      .unwrap_or(DEFAULT_EXTENSION)
      .to_ascii_lowercase();
    let target = self.storage.source_path(id, &extension);
    let bytes = std::fs::copy(upload, &target).map_err(io_error(&target))?;
    Ok((target, bytes))
  }

  /// 执行一个任务。任务进入 `processing` 之后的任何错误都记录在任务上并返回 `Ok`；
  /// 只有任务记录本身无法更新时返回错误
  pub fn process(&self, id: u64) -> Result<Job, TaskError> {
    let started = Instant::now();
    let log = self.job_log(id);

    let job = self.store.update_job(id, &mut |job: &mut Job| {
      job.status = JobStatus::Processing;
      job.error_message = None;
      job.duration_ms = None;
      job.restart(PROGRESS_RECEIVED);
    })?;
    info!("开始处理任务 {}", id);

    match self.attempt(&job, &log, started) {
      Ok(job) => Ok(job),
      Err(e) => self.fail(id, &log, e.to_string(), started),
    }
  }

  fn attempt(&self, job: &Job, log: &JobLog, started: Instant) -> Result<Job, TaskError> {
    let id = job.id;
    log.checkpoint(Checkpoint::JobReceived, json!({ "job_id": id }))?;
    log.checkpoint(
      Checkpoint::ModelLoading,
      json!({
        "detector": self.runner.detector_kind().as_str(),
        "device": self.runner.device().as_str(),
        "gallery_size": self.runner.gallery().size(),
      }),
    )?;
    self
      .store
      .update_job(id, &mut |job: &mut Job| job.advance(PROGRESS_MODEL_LOADING))?;

    let artifact_dir = job
      .artifact_dir
      .clone()
      .unwrap_or_else(|| self.storage.artifact_dir(id));
    let result = self.runner.run(&job.storage_path, &artifact_dir)?;
    self.complete(id, log, result, started)
  }

  fn complete(&self, id: u64, log: &JobLog, result: RunResult, started: Instant) -> Result<Job, TaskError> {
    log.checkpoint(
      Checkpoint::ModelCompleted,
      json!({
        "frames_processed": result.metrics.frames_processed,
        "detections": result.metrics.detections,
        "elapsed_sec": result.metrics.elapsed_sec,
      }),
    )?;

    let raw_json = serde_json::to_value(&result)?;
    self.store.upsert_result(JobResult {
      job_id: id,
      summary: result.summary,
      raw_json,
      created_at: Utc::now(),
    })?;

    let duration_ms = elapsed_ms(started);
    let job = self.store.update_job(id, &mut |job: &mut Job| {
      job.status = JobStatus::Completed;
      job.advance(PROGRESS_DONE);
      job.duration_ms = Some(duration_ms);
    })?;
    // 任务已经完成，日志写不进去不再改变状态
    if let Err(e) = log.checkpoint(Checkpoint::JobCompleted, json!({ "duration_ms": duration_ms })) {
      warn!("无法写入任务 {} 的日志: {}", id, e);
    }
    info!("任务 {} 完成, 耗时 {} 毫秒", id, duration_ms);
    Ok(job)
  }

  fn fail(&self, id: u64, log: &JobLog, message: String, started: Instant) -> Result<Job, TaskError> {
    error!("任务 {} 失败: {}", id, message);
    if let Err(e) = log.checkpoint(Checkpoint::ModelFailed, json!({ "error": message })) {
      warn!("无法写入任务 {} 的日志: {}", id, e);
    }

    let duration_ms = elapsed_ms(started);
    let job = self.store.update_job(id, &mut |job: &mut Job| {
      job.status = JobStatus::Failed;
      job.error_message = Some(message.clone());
      job.duration_ms = Some(duration_ms);
    })?;

    if let Err(e) = log.checkpoint(Checkpoint::JobFailed, json!({ "duration_ms": duration_ms })) {
      warn!("无法写入任务 {} 的日志: {}", id, e);
    }
    Ok(job)
  }
}

fn elapsed_ms(started: Instant) -> u64 {
  started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

/// 固定数量的后台线程，共享一个任务编号通道
pub struct JobQueue {
  sender: Option<Sender<u64>>,
  workers: Vec<JoinHandle<()>>,
}

impl JobQueue {
  pub fn start<D, E>(task: Arc<AnalysisTask<D, E>>, workers: usize) -> Self
  where
    D: FrameDetector + Send + Sync + 'static,
    D::Error: std::fmt::Display,
    E: Model<Input = [RgbImage], Output = Array2<f32>, Error = ExtractError> + Send + Sync + 'static,
  {
    let (sender, receiver) = mpsc::channel::<u64>();
    let receiver = Arc::new(Mutex::new(receiver));

    let workers = (0..workers.max(1))
      .map(|worker| {
        let task = Arc::clone(&task);
        let receiver = Arc::clone(&receiver);
        thread::spawn(move || worker_loop(worker, &*task, &*receiver))
      })
      .collect();

    Self {
      sender: Some(sender),
      workers,
    }
  }

  pub fn enqueue(&self, id: u64) -> Result<(), TaskError> {
    self
      .sender
      .as_ref()
      .ok_or(TaskError::QueueClosed)?
      .send(id)
      .map_err(|_| TaskError::QueueClosed)
  }

  /// 不再接收新任务，等待已入队的任务全部处理完
  pub fn shutdown(mut self) {
    self.close();
  }

  fn close(&mut self) {
    self.sender.take();
    for worker in self.workers.drain(..) {
      if worker.join().is_err() {
        warn!("后台线程异常退出");
      }
    }
  }
}

impl Drop for JobQueue {
  fn drop(&mut self) {
    self.close();
  }
}

fn worker_loop<D, E>(worker: usize, task: &AnalysisTask<D, E>, receiver: &Mutex<Receiver<u64>>)
where
  D: FrameDetector,
  D::Error: std::fmt::Display,
  E: Model<Input = [RgbImage], Output = Array2<f32>, Error = ExtractError>,
{
  loop {
    let next = match receiver.lock() {
      Ok(receiver) => receiver.recv(),
      Err(poisoned) => poisoned.into_inner().recv(),
    };
    let Ok(id) = next else {
      break;
    };
    info!("后台线程 {} 领取任务 {}", worker, id);
    if let Err(e) = task.process(id) {
      error!("任务 {} 无法记录状态: {}", id, e);
    }
  }
  info!("后台线程 {} 退出", worker);
}
