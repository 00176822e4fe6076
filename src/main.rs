// 该文件是 Xunche （寻车） 项目的一部分。
// src/main.rs - 命令行入口
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

mod args;

use std::{
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xunche::{
  ModelRunner, StorageConfig,
  job::{DirectoryJobStore, JobLog, JobStatus, JobStore, NewJob},
  task::{AnalysisTask, JobQueue},
};

use args::{Args, Command, ModelArgs, StorageArgs};

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();
  match args.command {
    Command::Analyze {
      video,
      artifacts,
      model,
    } => analyze(video, artifacts, model),
    Command::Submit {
      uploads,
      title,
      description,
      workers,
      model,
      storage,
    } => submit(uploads, title, description, workers, model, storage),
    Command::Status { id, full, storage } => status(id, full, storage.into_config()),
    Command::Logs { id, tail, storage } => logs(id, tail, storage.into_config()),
    Command::List { status, storage } => list(status, storage.into_config()),
  }
}

fn load_runner(model: ModelArgs) -> Result<ModelRunner> {
  let config = model.into_config().context("无法解析模型配置")?;
  info!("采样步长: {}, 最大帧数: {}, 批大小: {}", config.stride(), config.max_frames, config.batch());
  ModelRunner::from_config(config).context("无法初始化分析器")
}

fn analyze(video: PathBuf, artifacts: PathBuf, model: ModelArgs) -> Result<()> {
  info!("视频: {}", video.display());
  info!("快照目录: {}", artifacts.display());

  let runner = load_runner(model)?;
  let result = runner
    .run(&video, &artifacts)
    .with_context(|| format!("分析失败: {}", video.display()))?;

  info!("{}", result.summary);
  println!("{}", serde_json::to_string_pretty(&result)?);
  Ok(())
}

fn submit(
  uploads: Vec<PathBuf>,
  title: Option<String>,
  description: Option<String>,
  workers: usize,
  model: ModelArgs,
  storage: StorageArgs,
) -> Result<()> {
  let storage = storage.into_config();
  let runner = Arc::new(load_runner(model)?);
  let store: Arc<dyn JobStore> = Arc::new(DirectoryJobStore::new(storage.clone()));
  let task = Arc::new(AnalysisTask::new(runner, Arc::clone(&store), storage));
  let queue = JobQueue::start(Arc::clone(&task), workers);

  let interrupted = Arc::new(AtomicBool::new(false));
  {
    let interrupted = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
      info!("收到中断信号，不再提交新任务，等待已提交的任务完成...");
      interrupted.store(true, Ordering::SeqCst);
    })
    .context("无法设置中断信号处理")?;
  }

  let mut submitted = Vec::with_capacity(uploads.len());
  for upload in &uploads {
    if interrupted.load(Ordering::SeqCst) {
      warn!("中断信号接收，跳过剩余 {} 个上传", uploads.len() - submitted.len());
      break;
    }
    let new = NewJob {
      title: title.clone().unwrap_or_default(),
      description: description.clone(),
      original_filename: String::new(),
    };
    let job = task
      .submit(upload, new)
      .with_context(|| format!("无法提交: {}", upload.display()))?;
    queue.enqueue(job.id)?;
    submitted.push(job.id);
  }

  queue.shutdown();

  for id in submitted {
    let job = store.load_job(id)?;
    match job.status {
      JobStatus::Failed => println!(
        "{}\t{}\t{}",
        job.id,
        job.status,
        job.error_message.unwrap_or_default()
      ),
      _ => println!("{}\t{}\t{}", job.id, job.status, job.title),
    }
  }
  Ok(())
}

fn status(id: u64, full: bool, storage: StorageConfig) -> Result<()> {
  let store = DirectoryJobStore::new(storage);
  let job = store.load_job(id).with_context(|| format!("无法读取任务 {}", id))?;
  println!("{}", serde_json::to_string_pretty(&job)?);

  match store.load_result(id)? {
    Some(result) if full => println!("{}", serde_json::to_string_pretty(&result.raw_json)?),
    Some(result) => println!("{}", result.summary),
    None if job.status == JobStatus::Completed => warn!("任务 {} 已完成但没有结果记录", id),
    None => {}
  }
  Ok(())
}

fn logs(id: u64, tail: usize, storage: StorageConfig) -> Result<()> {
  let log = JobLog::new(storage.log_path(id));
  let entries = log
    .tail(tail)
    .with_context(|| format!("无法读取任务日志 {}", log.path().display()))?;
  for entry in entries {
    println!("{}", serde_json::to_string(&entry)?);
  }
  Ok(())
}

fn list(status: Option<String>, storage: StorageConfig) -> Result<()> {
  let filter = status
    .map(|s| s.parse::<JobStatus>())
    .transpose()
    .context("无法解析任务状态")?;
  let store = DirectoryJobStore::new(storage);
  for job in store.list_jobs()? {
    if filter.is_some_and(|status| status != job.status) {
      continue;
    }
    println!(
      "{}\t{}\t{:>3}%\t{}\t{}",
      job.id,
      job.status,
      job.progress,
      job.created_at.to_rfc3339(),
      job.title
    );
  }
  Ok(())
}
