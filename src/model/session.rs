// 该文件是 Xunche （寻车） 项目的一部分。
// src/model/session.rs - ONNX Runtime 会话
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

use std::path::{Path, PathBuf};

use ort::{
  execution_providers::{CUDAExecutionProvider, CoreMLExecutionProvider},
  session::{Session, builder::GraphOptimizationLevel},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Device;

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("模型加载错误 {path}: {reason}")]
  Load { path: PathBuf, reason: String },
  #[error("推理错误: {0}")]
  Runtime(String),
  #[error("会话锁已失效")]
  Poisoned,
}

impl SessionError {
  fn load(path: &Path, reason: impl std::fmt::Display) -> Self {
    SessionError::Load {
      path: path.to_path_buf(),
      reason: reason.to_string(),
    }
  }

  pub fn runtime(reason: impl std::fmt::Display) -> Self {
    SessionError::Runtime(reason.to_string())
  }
}

/// 按设备创建推理会话
pub(crate) fn build_session(path: &Path, device: Device) -> Result<Session, SessionError> {
  if !path.is_file() {
    return Err(SessionError::NotFound(path.to_path_buf()));
  }

  info!("加载模型文件: {} ({})", path.display(), device);
  let mut builder = Session::builder().map_err(|e| SessionError::load(path, e))?;

  builder = match device {
    Device::Cuda => builder
      .with_execution_providers([CUDAExecutionProvider::default().build()])
      .map_err(|e| SessionError::load(path, e))?,
    Device::CoreMl => builder
      .with_execution_providers([CoreMLExecutionProvider::default().build()])
      .map_err(|e| SessionError::load(path, e))?,
    Device::Cpu => builder,
  };

  let session = builder
    .with_optimization_level(GraphOptimizationLevel::Level3)
    .map_err(|e| SessionError::load(path, e))?
    .commit_from_file(path)
    .map_err(|e| SessionError::load(path, e))?;

  debug!(
    "模型输入: {:?}, 输出: {:?}",
    input_names(&session),
    session.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>()
  );
  Ok(session)
}

pub(crate) fn input_names(session: &Session) -> Vec<String> {
  session.inputs.iter().map(|i| i.name.clone()).collect()
}
