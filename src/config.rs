// 该文件是 Xunche （寻车） 项目的一部分。
// src/config.rs - 运行配置
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

use std::{fmt, path::PathBuf, str::FromStr};

use ort::execution_providers::{CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_FRAME_STRIDE: usize = 5;
pub const DEFAULT_MAX_FRAMES: usize = 200;
pub const DEFAULT_BATCH_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("未知的计算设备: {0}")]
  UnknownDevice(String),
}

/// 推理设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
  Cuda,
  CoreMl,
  Cpu,
}

impl Device {
  /// 自动选择时的探测顺序：首选加速器、次选加速器、CPU
  pub const AUTO_ORDER: [Device; 3] = [Device::Cuda, Device::CoreMl, Device::Cpu];

  pub fn as_str(&self) -> &'static str {
    match self {
      Device::Cuda => "cuda",
      Device::CoreMl => "coreml",
      Device::Cpu => "cpu",
    }
  }

  /// 按偏好字符串解析设备，`auto` 时使用 ONNX Runtime 探测可用的执行后端
  pub fn resolve(preference: &str) -> Result<Self, ConfigError> {
    Self::resolve_with(preference, Self::is_available)
  }

  pub fn resolve_with(
    preference: &str,
    probe: impl Fn(Device) -> bool,
  ) -> Result<Self, ConfigError> {
    if !preference.trim().eq_ignore_ascii_case("auto") {
      return preference.parse();
    }

    let device = Self::AUTO_ORDER
      .into_iter()
      .find(|device| *device == Device::Cpu || probe(*device))
      .unwrap_or(Device::Cpu);
    info!("自动选择推理设备: {}", device);
    Ok(device)
  }

  fn is_available(self) -> bool {
    let available = match self {
      Device::Cuda => CUDAExecutionProvider::default().is_available(),
      Device::CoreMl => CoreMLExecutionProvider::default().is_available(),
      Device::Cpu => return true,
    };
    match available {
      Ok(available) => available,
      Err(e) => {
        debug!("探测 {} 执行后端失败: {}", self, e);
        false
      }
    }
  }
}

impl FromStr for Device {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "cuda" | "gpu" => Ok(Device::Cuda),
      "coreml" | "mps" => Ok(Device::CoreMl),
      "cpu" => Ok(Device::Cpu),
      other => Err(ConfigError::UnknownDevice(other.to_string())),
    }
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 模型运行配置，进程启动时解析一次，之后只读
#[derive(Debug, Clone)]
pub struct ModelConfig {
  /// 检测器权重（YOLO 导出的 ONNX）
  pub detector_weights: Option<PathBuf>,
  /// 自定义重识别权重
  pub extractor_weights: Option<PathBuf>,
  /// 通用预训练骨干网络权重
  pub backbone_weights: Option<PathBuf>,
  pub gallery_features: Option<PathBuf>,
  pub gallery_names: Option<PathBuf>,
  /// 标注字体
  pub label_font: Option<PathBuf>,
  pub frame_stride: usize,
  pub max_frames: usize,
  pub batch_size: usize,
  pub device: Device,
}

impl Default for ModelConfig {
  fn default() -> Self {
    Self {
      detector_weights: None,
      extractor_weights: None,
      backbone_weights: None,
      gallery_features: None,
      gallery_names: None,
      label_font: None,
      frame_stride: DEFAULT_FRAME_STRIDE,
      max_frames: DEFAULT_MAX_FRAMES,
      batch_size: DEFAULT_BATCH_SIZE,
      device: Device::Cpu,
    }
  }
}

impl ModelConfig {
  pub fn stride(&self) -> usize {
    self.frame_stride.max(1)
  }

  pub fn batch(&self) -> usize {
    self.batch_size.max(1)
  }
}

/// 任务存储目录布局
#[derive(Debug, Clone)]
pub struct StorageConfig {
  pub storage_dir: PathBuf,
  pub log_dir: PathBuf,
}

impl StorageConfig {
  pub fn new(storage_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
    Self {
      storage_dir: storage_dir.into(),
      log_dir: log_dir.into(),
    }
  }

  pub fn job_dir(&self, job_id: u64) -> PathBuf {
    self.storage_dir.join(job_id.to_string())
  }

  pub fn source_path(&self, job_id: u64, extension: &str) -> PathBuf {
    self.job_dir(job_id).join(format!("source.{}", extension))
  }

  pub fn artifact_dir(&self, job_id: u64) -> PathBuf {
    self.job_dir(job_id).join("artifacts")
  }

  pub fn log_path(&self, job_id: u64) -> PathBuf {
    self.log_dir.join(format!("job_{}.log", job_id))
  }
}
