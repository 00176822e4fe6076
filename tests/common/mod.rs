// 该文件是 Xunche （寻车） 项目的一部分。
// tests/common/mod.rs - 测试用的合成视频与替身模型
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

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use ndarray::{Array2, Array4, Axis};
use xunche::{
  GalleryIndex, ModelConfig, ModelRunner,
  gallery::GalleryStatus,
  model::{Backbone, ExtractError, FallbackReason, FeatureExtractor, FrameDetector, VehicleDetector},
  output::draw::Draw,
};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;

/// 每帧纯色，红色通道为帧序号的十倍
pub fn write_video(dir: &Path, frames: usize, fps: Option<f64>) -> PathBuf {
  let video = dir.join("video");
  std::fs::create_dir_all(&video).unwrap();
  for i in 0..frames {
    let image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([(i * 10 % 256) as u8, 100, 50]));
    image.save(video.join(format!("frame_{:04}.png", i))).unwrap();
  }
  if let Some(fps) = fps {
    std::fs::write(video.join("fps"), fps.to_string()).unwrap();
  }
  video
}

/// 每个样本三通道均值加一个常数
pub struct ChannelMean;

impl Backbone for ChannelMean {
  fn forward(&self, batch: Array4<f32>) -> Result<Array2<f32>, ExtractError> {
    let n = batch.len_of(Axis(0));
    let mut out = Array2::zeros((n, 4));
    for i in 0..n {
      let sample = batch.index_axis(Axis(0), i);
      for c in 0..3 {
        out[[i, c]] = sample.index_axis(Axis(0), c).mean().unwrap_or(0.0);
      }
      out[[i, 3]] = 1.0;
    }
    Ok(out)
  }

  fn feature_dim(&self) -> usize {
    4
  }
}

pub fn config(stride: usize, max_frames: usize, batch_size: usize) -> ModelConfig {
  ModelConfig {
    frame_stride: stride,
    max_frames,
    batch_size,
    ..ModelConfig::default()
  }
}

pub fn runner<D>(
  detector: D,
  gallery: GalleryIndex,
  config: ModelConfig,
) -> ModelRunner<D, FeatureExtractor<ChannelMean>>
where
  D: FrameDetector,
  D::Error: std::fmt::Display,
{
  let extractor = FeatureExtractor::new(ChannelMean, config.batch());
  ModelRunner::new(config, detector, extractor, gallery, Draw::default())
}

pub fn no_gallery() -> GalleryIndex {
  GalleryIndex::not_ready(GalleryStatus::Missing(None))
}

pub fn full_frame() -> VehicleDetector {
  VehicleDetector::full_frame(FallbackReason::NoWeights)
}
