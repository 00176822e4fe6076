// 该文件是 Xunche （寻车） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use xunche::{
  ModelConfig, StorageConfig,
  config::{ConfigError, DEFAULT_BATCH_SIZE, DEFAULT_FRAME_STRIDE, DEFAULT_MAX_FRAMES, Device},
};

/// 寻车：视频车辆检测与重识别
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 直接分析一个视频，结果以 JSON 输出到标准输出
  Analyze {
    /// 视频文件，或按文件名排序的图像帧目录
    #[arg(value_name = "VIDEO")]
    video: PathBuf,
    /// 检测快照保存目录
    #[arg(long, value_name = "DIR", default_value = "artifacts")]
    artifacts: PathBuf,
    #[command(flatten)]
    model: ModelArgs,
  },
  /// 提交视频为后台任务并等待全部完成
  Submit {
    #[arg(value_name = "UPLOAD", required = true)]
    uploads: Vec<PathBuf>,
    /// 任务标题，缺省使用文件名
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// 后台线程数
    #[arg(long, env = "XUNCHE_WORKERS", default_value_t = 1)]
    workers: usize,
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    storage: StorageArgs,
  },
  /// 查看任务状态与结果摘要
  Status {
    id: u64,
    /// 同时输出完整结果
    #[arg(long)]
    full: bool,
    #[command(flatten)]
    storage: StorageArgs,
  },
  /// 查看任务日志的最后若干条
  Logs {
    id: u64,
    #[arg(long, default_value_t = 50)]
    tail: usize,
    #[command(flatten)]
    storage: StorageArgs,
  },
  /// 列出任务，最新的在前
  List {
    /// 只列出指定状态：queued, processing, completed, failed
    #[arg(long)]
    status: Option<String>,
    #[command(flatten)]
    storage: StorageArgs,
  },
}

/// 模型与分析参数
#[derive(ClapArgs, Debug)]
pub struct ModelArgs {
  /// 车辆检测权重（ONNX），缺省时整帧作为一个检测
  #[arg(long, env = "XUNCHE_DETECTOR_WEIGHTS", value_name = "FILE")]
  pub detector_weights: Option<PathBuf>,
  /// 自定义重识别权重（ONNX）
  #[arg(long, env = "XUNCHE_EXTRACTOR_WEIGHTS", value_name = "FILE")]
  pub extractor_weights: Option<PathBuf>,
  /// 通用骨干网络权重（ONNX），自定义权重不可用时使用
  #[arg(long, env = "XUNCHE_BACKBONE_WEIGHTS", value_name = "FILE")]
  pub backbone_weights: Option<PathBuf>,
  /// 底库特征（.npy）
  #[arg(long, env = "XUNCHE_GALLERY_FEATURES", value_name = "FILE")]
  pub gallery_features: Option<PathBuf>,
  /// 底库名称（JSON 数组或每行一个）
  #[arg(long, env = "XUNCHE_GALLERY_NAMES", value_name = "FILE")]
  pub gallery_names: Option<PathBuf>,
  /// 快照标签字体
  #[arg(long, env = "XUNCHE_LABEL_FONT", value_name = "FILE")]
  pub label_font: Option<PathBuf>,
  /// 采样步长
  #[arg(long, env = "XUNCHE_FRAME_STRIDE", default_value_t = DEFAULT_FRAME_STRIDE)]
  pub frame_stride: usize,
  /// 最多处理的帧数
  #[arg(long, env = "XUNCHE_MAX_FRAMES", default_value_t = DEFAULT_MAX_FRAMES)]
  pub max_frames: usize,
  /// 特征提取批大小
  #[arg(long, env = "XUNCHE_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
  pub batch_size: usize,
  /// 推理设备：auto, cuda, coreml, cpu
  #[arg(long, env = "XUNCHE_DEVICE", default_value = "auto")]
  pub device: String,
}

impl ModelArgs {
  pub fn into_config(self) -> Result<ModelConfig, ConfigError> {
    Ok(ModelConfig {
      detector_weights: self.detector_weights,
      extractor_weights: self.extractor_weights,
      backbone_weights: self.backbone_weights,
      gallery_features: self.gallery_features,
      gallery_names: self.gallery_names,
      label_font: self.label_font,
      frame_stride: self.frame_stride,
      max_frames: self.max_frames,
      batch_size: self.batch_size,
      device: Device::resolve(&self.device)?,
    })
  }
}

/// 任务存储目录
#[derive(ClapArgs, Debug)]
pub struct StorageArgs {
  #[arg(long, env = "XUNCHE_STORAGE_DIR", default_value = "storage/videos")]
  pub storage_dir: PathBuf,
  #[arg(long, env = "XUNCHE_LOG_DIR", default_value = "storage/logs")]
  pub log_dir: PathBuf,
}

impl StorageArgs {
  pub fn into_config(self) -> StorageConfig {
    StorageConfig::new(self.storage_dir, self.log_dir)
  }
}
