// 该文件是 Xunche （寻车） 项目的一部分。
// src/job/log.rs - 任务事件日志
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

//! 每个任务一个 NDJSON 文件，每行一个事件对象，至少包含 `timestamp`（秒）与 `event`。
//! 读取时无法解析的行原样作为 `raw` 事件返回。

use std::{
  fs::OpenOptions,
  io::Write,
  path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub const RAW_EVENT: &str = "raw";

#[derive(Error, Debug)]
pub enum JobLogError {
  #[error("日志 I/O 错误 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("日志序列化错误: {0}")]
  Json(#[from] serde_json::Error),
}

/// 事件名称，日志消费方依赖这些名称
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
  UploadSaved,
  JobReceived,
  ModelLoading,
  ModelCompleted,
  ModelFailed,
  JobCompleted,
  JobFailed,
}

impl Checkpoint {
  pub fn as_str(&self) -> &'static str {
    match self {
      Checkpoint::UploadSaved => "upload_saved",
      Checkpoint::JobReceived => "job_received",
      Checkpoint::ModelLoading => "model_loading",
      Checkpoint::ModelCompleted => "model_completed",
      Checkpoint::ModelFailed => "model_failed",
      Checkpoint::JobCompleted => "job_completed",
      Checkpoint::JobFailed => "job_failed",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
  pub timestamp: Option<f64>,
  pub event: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl LogEntry {
  fn raw(line: &str) -> Self {
    let mut fields = Map::new();
    fields.insert("message".to_string(), Value::String(line.to_string()));
    Self {
      timestamp: None,
      event: RAW_EVENT.to_string(),
      fields,
    }
  }

  pub fn parse(line: &str) -> Self {
    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(line) else {
      return Self::raw(line);
    };
    let Some(Value::String(event)) = fields.remove("event") else {
      return Self::raw(line);
    };
    let timestamp = fields.remove("timestamp").and_then(|t| t.as_f64());
    Self {
      timestamp,
      event,
      fields,
    }
  }

  pub fn is_raw(&self) -> bool {
    self.timestamp.is_none() && self.event == RAW_EVENT
  }
}

#[derive(Debug, Clone)]
pub struct JobLog {
  path: PathBuf,
}

impl JobLog {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn io_error(&self, source: std::io::Error) -> JobLogError {
    JobLogError::Io {
      path: self.path.clone(),
      source,
    }
  }

  /// 丢弃旧日志，重试的任务从空日志开始
  pub fn reset(&self) -> Result<(), JobLogError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
    }
    if self.path.exists() {
      std::fs::remove_file(&self.path).map_err(|e| self.io_error(e))?;
    }
    std::fs::File::create(&self.path).map_err(|e| self.io_error(e))?;
    Ok(())
  }

  /// 追加一个事件，`fields` 为对象时展开到事件中
  pub fn append(&self, event: &str, fields: Value) -> Result<(), JobLogError> {
    let mut payload = Map::new();
    payload.insert("timestamp".to_string(), Value::from(epoch_seconds()));
    payload.insert("event".to_string(), Value::String(event.to_string()));
    match fields {
      Value::Object(fields) => {
        for (key, value) in fields {
          if key != "timestamp" && key != "event" {
            payload.insert(key, value);
          }
        }
      }
      Value::Null => {}
      other => {
        payload.insert("value".to_string(), other);
      }
    }

    let mut line = serde_json::to_string(&payload)?;
    line.push('\n');

    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
    }
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .map_err(|e| self.io_error(e))?;
    file.write_all(line.as_bytes()).map_err(|e| self.io_error(e))
  }

  pub fn checkpoint(&self, checkpoint: Checkpoint, fields: Value) -> Result<(), JobLogError> {
    self.append(checkpoint.as_str(), fields)
  }

  /// 最后 `n` 条事件，日志不存在时为空
  pub fn tail(&self, n: usize) -> Result<Vec<LogEntry>, JobLogError> {
    let text = match std::fs::read_to_string(&self.path) {
      Ok(text) => text,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(self.io_error(e)),
    };
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].iter().map(|line| LogEntry::parse(line)).collect())
  }
}

fn epoch_seconds() -> f64 {
  Utc::now().timestamp_micros() as f64 / 1e6
}
