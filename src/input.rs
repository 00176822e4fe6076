// 该文件是 Xunche （寻车） 项目的一部分。
// src/input.rs - 视频输入与帧采样
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

use image::RgbImage;
use thiserror::Error;
use tracing::info;

use crate::frame::VideoFrame;

/// 无法读取帧率时使用的默认值
pub const DEFAULT_FPS: f64 = 30.0;

/// 按顺序解码出的原始帧
pub trait VideoSource: Iterator<Item = Result<RgbImage, InputError>> {
  /// 容器声明的帧率
  fn fps(&self) -> Option<f64>;
}

mod image_sequence;
pub use self::image_sequence::ImageSequenceInput;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("视频文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("无法打开视频 {path}: {reason}")]
  Open { path: PathBuf, reason: String },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("不支持的输入源: {0}")]
  Unsupported(PathBuf),
}

pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  ImageSequence(ImageSequenceInput),
}

impl InputWrapper {
  /// 打开视频：目录按图像序列读取，其余文件交给 GStreamer 解码
  pub fn open(path: &Path) -> Result<Self, InputError> {
    if !path.exists() {
      return Err(InputError::NotFound(path.to_path_buf()));
    }

    if path.is_dir() {
      info!("以图像序列方式打开: {}", path.display());
      return Ok(InputWrapper::ImageSequence(ImageSequenceInput::open(path)?));
    }

    Self::open_container(path)
  }

  #[cfg(feature = "gstreamer_input")]
  fn open_container(path: &Path) -> Result<Self, InputError> {
    info!("以 GStreamer 方式打开: {}", path.display());
    Ok(InputWrapper::GStreamerInput(GStreamerInput::open(path)?))
  }

  #[cfg(not(feature = "gstreamer_input"))]
  fn open_container(path: &Path) -> Result<Self, InputError> {
    Err(InputError::Unsupported(path.to_path_buf()))
  }
}

impl Iterator for InputWrapper {
  type Item = Result<RgbImage, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.next(),
      InputWrapper::ImageSequence(input) => input.next(),
    }
  }
}

impl VideoSource for InputWrapper {
  fn fps(&self) -> Option<f64> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.fps(),
      InputWrapper::ImageSequence(input) => input.fps(),
    }
  }
}

/// 帧采样器：从第 0 帧开始，只保留 `index % stride == 0` 的帧，最多保留 `max_frames` 帧
pub struct FrameSampler<S> {
  source: S,
  stride: usize,
  max_frames: usize,
  fps: f64,
  next_index: usize,
  retained: usize,
}

impl<S: VideoSource> FrameSampler<S> {
  pub fn new(source: S, stride: usize, max_frames: usize) -> Self {
    let fps = source
      .fps()
      .filter(|fps| fps.is_finite() && *fps > 0.0)
      .unwrap_or(DEFAULT_FPS);
    Self {
      source,
      stride: stride.max(1),
      max_frames,
      fps,
      next_index: 0,
      retained: 0,
    }
  }

  pub fn fps(&self) -> f64 {
    self.fps
  }

  pub fn retained(&self) -> usize {
    self.retained
  }
}

impl<S: VideoSource> Iterator for FrameSampler<S> {
  type Item = Result<VideoFrame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.retained >= self.max_frames {
      return None;
    }

    loop {
      let image = match self.source.next()? {
        Ok(image) => image,
        Err(e) => return Some(Err(e)),
      };
      let index = self.next_index;
      self.next_index += 1;

      if index % self.stride != 0 {
        continue;
      }

      self.retained += 1;
      return Some(Ok(VideoFrame::new(index, self.fps, image)));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Synthetic {
    remaining: usize,
    fps: Option<f64>,
    pulled: usize,
  }

  impl Synthetic {
    fn new(frames: usize, fps: Option<f64>) -> Self {
      Self {
        remaining: frames,
        fps,
        pulled: 0,
      }
    }
  }

  impl Iterator for Synthetic {
    type Item = Result<RgbImage, InputError>;

    fn next(&mut self) -> Option<Self::Item> {
      if self.remaining == 0 {
        return None;
      }
      self.remaining -= 1;
      self.pulled += 1;
      Some(Ok(RgbImage::new(8, 8)))
    }
  }

  impl VideoSource for Synthetic {
    fn fps(&self) -> Option<f64> {
      self.fps
    }
  }

  #[test]
  fn retained_count_is_min_of_cap_and_ceil() {
    for frames in [0usize, 1, 4, 5, 6, 29, 300] {
      for stride in [1usize, 2, 5, 7] {
        for cap in [0usize, 1, 3, 60, 200] {
          let sampler = FrameSampler::new(Synthetic::new(frames, Some(30.0)), stride, cap);
          let count = sampler.map(|f| f.unwrap()).count();
          assert_eq!(
            count,
            cap.min(frames.div_ceil(stride)),
            "frames={frames} stride={stride} cap={cap}"
          );
        }
      }
    }
  }

  #[test]
  fn ten_seconds_at_thirty_fps() {
    let sampler = FrameSampler::new(Synthetic::new(300, Some(30.0)), 5, 200);
    let frames: Vec<_> = sampler.map(|f| f.unwrap()).collect();
    assert_eq!(frames.len(), 60);
    assert!(frames.iter().all(|f| f.index % 5 == 0));
    assert_eq!(frames.last().map(|f| f.index), Some(295));
  }

  #[test]
  fn stops_reading_once_cap_is_reached() {
    let mut sampler = FrameSampler::new(Synthetic::new(100, None), 1, 3);
    while sampler.next().is_some() {}
    assert_eq!(sampler.retained(), 3);
    assert_eq!(sampler.source.pulled, 3);
  }

  #[test]
  fn missing_fps_defaults_to_thirty() {
    let sampler = FrameSampler::new(Synthetic::new(1, None), 1, 1);
    assert_eq!(sampler.fps(), DEFAULT_FPS);
    let sampler = FrameSampler::new(Synthetic::new(1, Some(0.0)), 1, 1);
    assert_eq!(sampler.fps(), DEFAULT_FPS);
  }

  #[test]
  fn missing_path_is_not_found() {
    let err = InputWrapper::open(Path::new("/definitely/not/here.mp4"))
      .err()
      .unwrap();
    assert!(matches!(err, InputError::NotFound(_)));
  }
}
