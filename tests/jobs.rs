// 该文件是 Xunche （寻车） 项目的一部分。
// tests/jobs.rs - 任务提交、执行与日志测试
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

mod common;

use std::{
  path::Path,
  sync::{Arc, Mutex},
};

use xunche::{
  StorageConfig,
  job::{DirectoryJobStore, Job, JobResult, JobStatus, JobStore, MemoryJobStore, NewJob, StoreError},
  model::{FeatureExtractor, VehicleDetector},
  task::{AnalysisTask, JobQueue, TaskError},
};

use common::{ChannelMean, config, full_frame, no_gallery, runner, write_video};

type Task = AnalysisTask<VehicleDetector, FeatureExtractor<ChannelMean>>;

fn storage(root: &Path) -> StorageConfig {
  StorageConfig::new(root.join("videos"), root.join("logs"))
}

fn task(store: Arc<dyn JobStore>, storage: StorageConfig) -> Task {
  let runner = Arc::new(runner(full_frame(), no_gallery(), config(1, 200, 4)));
  AnalysisTask::new(runner, store, storage)
}

fn new_job(title: &str) -> NewJob {
  NewJob {
    title: title.to_string(),
    ..NewJob::default()
  }
}

/// 记录每次保存的状态与进度，可让写入结果失败
#[derive(Default)]
struct Recording {
  inner: MemoryJobStore,
  reject_results: bool,
  saved: Mutex<Vec<(JobStatus, u8)>>,
}

impl Recording {
  fn saved(&self) -> Vec<(JobStatus, u8)> {
    self.saved.lock().unwrap().clone()
  }
}

impl JobStore for Recording {
  fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
    self.inner.create_job(new)
  }

  fn save_job(&self, job: &Job) -> Result<(), StoreError> {
    self.saved.lock().unwrap().push((job.status, job.progress));
    self.inner.save_job(job)
  }

  fn load_job(&self, id: u64) -> Result<Job, StoreError> {
    self.inner.load_job(id)
  }

  fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
    self.inner.list_jobs()
  }

  fn upsert_result(&self, result: JobResult) -> Result<(), StoreError> {
    if self.reject_results {
      return Err(StoreError::Poisoned);
    }
    self.inner.upsert_result(result)
  }

  fn load_result(&self, id: u64) -> Result<Option<JobResult>, StoreError> {
    self.inner.load_result(id)
  }
}

fn events(task: &Task, id: u64) -> Vec<String> {
  task
    .job_log(id)
    .tail(100)
    .unwrap()
    .into_iter()
    .map(|entry| entry.event)
    .collect()
}

#[test]
fn completed_job_walks_every_checkpoint() {
  let dir = tempfile::tempdir().unwrap();
  let video = write_video(dir.path(), 3, Some(10.0));
  let task = task(Arc::new(MemoryJobStore::new()), storage(dir.path()));

  let job = task.submit(&video, new_job("gate camera")).unwrap();
  assert_eq!(job.status, JobStatus::Queued);
  assert_eq!(job.original_filename, "video");
  assert_eq!(job.storage_path, task.storage().job_dir(job.id).join("source"));
  assert!(job.storage_path.join("frame_0000.png").is_file());
  assert_eq!(events(&task, job.id), ["upload_saved"]);

  let job = task.process(job.id).unwrap();
  assert_eq!(job.status, JobStatus::Completed);
  assert_eq!(job.progress, 100);
  assert!(job.duration_ms.is_some());
  assert!(job.error_message.is_none());

  let result = task.store().load_result(job.id).unwrap().unwrap();
  assert_eq!(result.raw_json["frames_processed"], 3);
  assert_eq!(result.raw_json["metrics"]["detections"], 3);
  assert!(result.summary.starts_with("Processed 3 frames"));

  let artifacts = std::fs::read_dir(job.artifact_dir.unwrap()).unwrap().count();
  assert_eq!(artifacts, 3);

  assert_eq!(
    events(&task, job.id),
    [
      "upload_saved",
      "job_received",
      "model_loading",
      "model_completed",
      "job_completed"
    ]
  );
  let loading = &task.job_log(job.id).tail(100).unwrap()[2];
  assert_eq!(loading.fields["detector"], "full_frame");
  assert_eq!(loading.fields["device"], "cpu");
  assert_eq!(loading.fields["gallery_size"], 0);
}

#[test]
fn reprocessing_replaces_the_result() {
  let dir = tempfile::tempdir().unwrap();
  let video = write_video(dir.path(), 2, None);
  let storage = storage(dir.path());
  let store: Arc<dyn JobStore> = Arc::new(DirectoryJobStore::new(storage.clone()));
  let task = task(Arc::clone(&store), storage);

  let job = task.submit(&video, new_job("twice")).unwrap();
  task.process(job.id).unwrap();
  let first = store.load_result(job.id).unwrap().unwrap();
  task.process(job.id).unwrap();
  let second = store.load_result(job.id).unwrap().unwrap();

  assert!(second.created_at >= first.created_at);
  assert_eq!(second.raw_json["frames_processed"], 2);
  let results = std::fs::read_dir(task.storage().job_dir(job.id))
    .unwrap()
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_name().to_string_lossy().starts_with("result"))
    .count();
  assert_eq!(results, 1);
}

#[test]
fn failed_run_keeps_the_error_and_no_result() {
  let dir = tempfile::tempdir().unwrap();
  let video = write_video(dir.path(), 2, None);
  let task = task(Arc::new(MemoryJobStore::new()), storage(dir.path()));

  let job = task.submit(&video, new_job("vanished")).unwrap();
  std::fs::remove_dir_all(&job.storage_path).unwrap();

  let job = task.process(job.id).unwrap();
  assert_eq!(job.status, JobStatus::Failed);
  assert!(job.error_message.as_deref().unwrap().contains("视频文件不存在"));
  assert!(job.duration_ms.is_some());
  assert!(task.store().load_result(job.id).unwrap().is_none());

  let entries = task.job_log(job.id).tail(2).unwrap();
  assert_eq!(entries[0].event, "model_failed");
  assert_eq!(
    entries[0].fields["error"].as_str(),
    job.error_message.as_deref()
  );
  assert_eq!(entries[1].event, "job_failed");
}

#[test]
fn file_upload_keeps_its_extension() {
  let dir = tempfile::tempdir().unwrap();
  let upload = dir.path().join("Clip.MOV");
  std::fs::write(&upload, b"not really a video").unwrap();
  let task = task(Arc::new(MemoryJobStore::new()), storage(dir.path()));

  let job = task.submit(&upload, NewJob::default()).unwrap();
  assert_eq!(job.title, "Clip.MOV");
  assert_eq!(job.storage_path, task.storage().source_path(job.id, "mov"));
  assert_eq!(std::fs::read(&job.storage_path).unwrap(), b"not really a video");

  let saved = &task.job_log(job.id).tail(1).unwrap()[0];
  assert_eq!(saved.event, "upload_saved");
  assert_eq!(saved.fields["bytes"], 18);
}

#[test]
fn resubmitting_starts_a_fresh_log() {
  let dir = tempfile::tempdir().unwrap();
  let video = write_video(dir.path(), 1, None);
  let storage = storage(dir.path());

  // 旧进程留下的同编号日志
  std::fs::create_dir_all(&storage.log_dir).unwrap();
  std::fs::write(storage.log_path(1), "{\"event\":\"stale\",\"timestamp\":1.0}\n").unwrap();

  let task = task(Arc::new(MemoryJobStore::new()), storage);
  let job = task.submit(&video, new_job("fresh")).unwrap();
  assert_eq!(job.id, 1);
  assert_eq!(events(&task, job.id), ["upload_saved"]);
}

#[test]
fn missing_upload_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let task = task(Arc::new(MemoryJobStore::new()), storage(dir.path()));
  let err = task
    .submit(&dir.path().join("nothing.mp4"), NewJob::default())
    .unwrap_err();
  assert!(matches!(err, TaskError::UploadNotFound(_)));
  assert!(task.store().list_jobs().unwrap().is_empty());
}

#[test]
fn queue_drains_before_shutdown() {
  let dir = tempfile::tempdir().unwrap();
  let video = write_video(dir.path(), 2, None);
  let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
  let task = Arc::new(task(Arc::clone(&store), storage(dir.path())));

  let queue = JobQueue::start(Arc::clone(&task), 2);
  let ids: Vec<u64> = (0..3)
    .map(|i| {
      let job = task.submit(&video, new_job(&format!("clip {}", i))).unwrap();
      queue.enqueue(job.id).unwrap();
      job.id
    })
    .collect();
  queue.shutdown();

  for id in ids {
    let job = store.load_job(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed, "job {}", id);
    assert!(store.load_result(id).unwrap().is_some());
  }
}

#[test]
fn store_errors_after_start_fail_the_job() {
  let dir = tempfile::tempdir().unwrap();
  let video = write_video(dir.path(), 2, None);
  let store = Arc::new(Recording {
    reject_results: true,
    ..Recording::default()
  });
  let task = task(store.clone(), storage(dir.path()));

  let job = task.submit(&video, new_job("unsaved")).unwrap();
  let job = task.process(job.id).unwrap();

  assert_eq!(job.status, JobStatus::Failed);
  let message = job.error_message.as_deref().unwrap();
  assert!(message.contains(&StoreError::Poisoned.to_string()));
  assert_eq!(store.load_job(job.id).unwrap().status, JobStatus::Failed);
  assert!(store.load_result(job.id).unwrap().is_none());

  let events = events(&task, job.id);
  assert_eq!(events[events.len() - 2..], ["model_failed", "job_failed"]);
}

#[test]
fn log_errors_after_start_fail_the_job() {
  let dir = tempfile::tempdir().unwrap();
  let video = write_video(dir.path(), 1, None);
  let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
  let task = task(Arc::clone(&store), storage(dir.path()));

  let job = task.submit(&video, new_job("no log")).unwrap();
  let log = task.job_log(job.id);
  std::fs::remove_file(log.path()).unwrap();
  std::fs::create_dir(log.path()).unwrap();

  let job = task.process(job.id).unwrap();
  assert_eq!(job.status, JobStatus::Failed);
  assert!(job.error_message.is_some());
  assert!(job.duration_ms.is_some());
}

#[test]
fn reprocessing_restarts_progress() {
  let dir = tempfile::tempdir().unwrap();
  let video = write_video(dir.path(), 1, None);
  let store = Arc::new(Recording::default());
  let task = task(store.clone(), storage(dir.path()));

  let job = task.submit(&video, new_job("again")).unwrap();
  task.process(job.id).unwrap();
  let first_run = store.saved().len();
  let job = task.process(job.id).unwrap();
  assert_eq!(job.progress, 100);

  let second_run = &store.saved()[first_run..];
  assert_eq!(
    second_run,
    [
      (JobStatus::Processing, 10),
      (JobStatus::Processing, 30),
      (JobStatus::Completed, 100)
    ]
  );
}
