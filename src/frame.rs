// 该文件是 Xunche （寻车） 项目的一部分。
// src/frame.rs - 视频帧与检测框定义
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

use std::sync::Arc;

use image::{RgbImage, imageops};
use serde::{Serialize, Serializer, ser::SerializeTuple};

/// 检测框的最小边长（像素），小于该值的框会被丢弃
pub const MIN_BOX_SIZE: u32 = 5;

/// 采样得到的一帧
#[derive(Debug, Clone)]
pub struct VideoFrame {
  /// 在原视频中的帧序号
  pub index: usize,
  /// 时间戳（秒）
  pub timestamp: f64,
  pub image: Arc<RgbImage>,
}

impl VideoFrame {
  pub fn new(index: usize, fps: f64, image: RgbImage) -> Self {
    Self {
      index,
      timestamp: index as f64 / fps.max(1e-3),
      image: Arc::new(image),
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn timestamp_ms(&self) -> u64 {
    (self.timestamp * 1000.0) as u64
  }
}

/// 像素坐标检测框 [x1, y1, x2, y2]，满足 0 <= x1 < x2 <= width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
  pub x1: u32,
  pub y1: u32,
  pub x2: u32,
  pub y2: u32,
}

impl BoundingBox {
  pub fn full_frame(width: u32, height: u32) -> Self {
    Self {
      x1: 0,
      y1: 0,
      x2: width,
      y2: height,
    }
  }

  /// 将浮点坐标截断为整数并裁剪到画面范围内，过小的框返回 None
  pub fn clamped(bbox: [f32; 4], width: u32, height: u32) -> Option<Self> {
    let clamp = |v: f32, max: u32| -> u32 {
      if v.is_nan() {
        return 0;
      }
      (v as i64).clamp(0, max as i64) as u32
    };

    let x1 = clamp(bbox[0], width);
    let y1 = clamp(bbox[1], height);
    let x2 = clamp(bbox[2], width);
    let y2 = clamp(bbox[3], height);

    if x2 < x1 + MIN_BOX_SIZE || y2 < y1 + MIN_BOX_SIZE {
      return None;
    }

    Some(Self { x1, y1, x2, y2 })
  }

  pub fn width(&self) -> u32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> u32 {
    self.y2 - self.y1
  }

  pub fn to_array(&self) -> [u32; 4] {
    [self.x1, self.y1, self.x2, self.y2]
  }

  pub fn crop(&self, image: &RgbImage) -> RgbImage {
    imageops::crop_imm(image, self.x1, self.y1, self.width(), self.height()).to_image()
  }
}

impl Serialize for BoundingBox {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut tuple = serializer.serialize_tuple(4)?;
    for v in self.to_array() {
      tuple.serialize_element(&v)?;
    }
    tuple.end()
  }
}
