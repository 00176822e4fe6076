// 该文件是 Xunche （寻车） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件输入
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

//! # GStreamer 视频文件输入
//!
//! 使用 `decodebin` 解码完整的视频文件，经 `videoconvert` 转为 RGB 后由 `appsink`
//! 逐帧拉取。与实时摄像头不同，这里不允许丢帧：采样器依赖连续的帧序号。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev \
//!   gstreamer1.0-plugins-good gstreamer1.0-libav
//! ```
//!
//! **macOS:**
//! ```bash
//! brew install gstreamer
//! ```
//!
//! 打开阶段会把管道切换到 PAUSED 并等待预卷，文件缺失、零字节或编码不受支持的视频
//! 都会在这里失败，而不是在迭代时静默结束。

use std::path::{Path, PathBuf};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{InputError, VideoSource};

/// 预卷等待时间
const PREROLL_TIMEOUT_SECS: u64 = 30;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取管道中的元素
  #[error("Failed to get pipeline element: {0}")]
  ElementNotFound(&'static str),
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format")]
  UnsupportedFormat,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 缓冲区大小不匹配
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

enum PipelineItem {
  FileSource,
  Decode,
  TargetFormat { format: &'static str },
  AppSink,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      // location 在构建后通过属性设置，避免路径中的空格破坏管道描述
      PipelineItem::FileSource => "filesrc name=src".to_string(),
      PipelineItem::Decode => "decodebin".to_string(),
      PipelineItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      PipelineItem::AppSink => "appsink name=sink sync=false max-buffers=4 drop=false".to_string(),
    }
  }
}

/// GStreamer 视频文件输入
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  fps: Option<f64>,
  finished: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn open(path: &Path) -> Result<Self, InputError> {
    let open_error = |reason: String| InputError::Open {
      path: path.to_path_buf(),
      reason,
    };

    let mut input = Self::build(path).map_err(|e| open_error(e.to_string()))?;

    // 预卷：失败时从总线上取出真实的错误原因
    input.pipeline.set_state(gst::State::Paused).map_err(|e| {
      open_error(input.bus_error().unwrap_or_else(|| e.to_string()))
    })?;
    let (state, _, _) = input
      .pipeline
      .state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
    if let Err(e) = state {
      return Err(open_error(input.bus_error().unwrap_or_else(|| e.to_string())));
    }

    let preroll = input
      .appsink
      .pull_preroll()
      .map_err(|e| open_error(input.bus_error().unwrap_or_else(|| e.to_string())))?;
    let fps = preroll
      .caps()
      .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
      .and_then(|info| {
        let fps = info.fps();
        (fps.numer() > 0 && fps.denom() > 0).then(|| fps.numer() as f64 / fps.denom() as f64)
      });
    info!("视频已打开: {}, 帧率: {:?}", path.display(), fps);

    input
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| open_error(e.to_string()))?;

    input.fps = fps;
    Ok(input)
  }

  fn build(path: &Path) -> Result<Self, GStreamerInputError> {
    gst::init()?;

    let description = [
      PipelineItem::FileSource,
      PipelineItem::Decode,
      PipelineItem::TargetFormat { format: "RGB" },
      PipelineItem::AppSink,
    ]
    .iter()
    .map(PipelineItem::to_pipeline)
    .collect::<Vec<String>>()
    .join(" ! ");
    debug!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let source = pipeline
      .by_name("src")
      .ok_or(GStreamerInputError::ElementNotFound("src"))?;
    source.set_property("location", path_location(path));

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::ElementNotFound("sink"))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::ElementNotFound("appsink"))?;

    Ok(GStreamerInput {
      pipeline,
      appsink,
      fps: None,
      finished: false,
    })
  }

  fn bus_error(&self) -> Option<String> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error])?;
    match message.view() {
      gst::MessageView::Error(err) => Some(match err.debug() {
        Some(debug) => format!("{} ({})", err.error(), debug),
        None => err.error().to_string(),
      }),
      _ => None,
    }
  }
}

fn path_location(path: &Path) -> String {
  let path: PathBuf = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
  path.to_string_lossy().into_owned()
}

impl Iterator for GStreamerInput {
  type Item = Result<RgbImage, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    match self.appsink.pull_sample() {
      Ok(sample) => Some(convert_sample_to_rgb(sample).map_err(InputError::from)),
      Err(e) => {
        self.finished = true;
        if self.appsink.is_eos() {
          debug!("视频流结束");
          return None;
        }
        let reason = self.bus_error().unwrap_or_else(|| e.to_string());
        error!("Failed to pull sample: {}", reason);
        Some(Err(GStreamerInputError::PipelineError(reason).into()))
      }
    }
  }
}

impl VideoSource for GStreamerInput {
  fn fps(&self) -> Option<f64> {
    self.fps
  }
}

fn convert_sample_to_rgb(sample: gst::Sample) -> Result<RgbImage, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(GStreamerInputError::UnsupportedFormat);
  }

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;
  let row_bytes = width * 3;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  // 行尾可能有对齐填充
  let expected_size = stride * (height.saturating_sub(1)) + row_bytes;
  if data.len() < expected_size || stride < row_bytes {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(row_bytes * height);
  for row in 0..height {
    let start = row * stride;
    pixels.extend_from_slice(&data[start..start + row_bytes]);
  }

  RgbImage::from_raw(width as u32, height as u32, pixels).ok_or(
    GStreamerInputError::BufferSizeMismatch {
      expected: row_bytes * height,
      actual: data.len(),
    },
  )
}
