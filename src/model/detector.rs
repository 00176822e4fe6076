// 该文件是 Xunche （寻车） 项目的一部分。
// src/model/detector.rs - 车辆检测器
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

//! # 车辆检测器
//!
//! 检测器有两种形态，在启动时根据权重文件是否存在、能否加载决定一次，之后不再改变：
//!
//! - [`VehicleDetector::Model`]：ONNX 导出的 YOLO 模型，输出 `[1, 4 + C, N]`（或转置的
//!   `[1, N, 4 + C]`），框格式为中心点加宽高。导出模型不带 NMS，这里按类别做一次。
//! - [`VehicleDetector::FullFrame`]：没有可用模型时，把整帧当作一个置信度 0.5 的检测。

use std::{path::PathBuf, sync::Mutex};

use image::{RgbImage, imageops::FilterType};
use ndarray::Array4;
use ort::{session::Session, value::Value};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
  DetectItem, DetectResult, FrameDetector, Model,
  session::{SessionError, build_session, input_names},
};
use crate::{config::ModelConfig, frame::BoundingBox};

/// 检测置信度阈值
pub const CONFIDENCE_THRESHOLD: f32 = 0.25;
/// 整帧回退检测的置信度
pub const FULL_FRAME_CONFIDENCE: f32 = 0.5;
/// NMS IoU 阈值
pub const NMS_IOU_THRESHOLD: f32 = 0.45;

const YOLO_INPUT_SIZE: u32 = 640;

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("会话错误: {0}")]
  Session(#[from] SessionError),
  #[error("检测输出格式错误: {0}")]
  Output(String),
}

/// 检测器形态，会写入运行指标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
  Model,
  FullFrame,
}

impl DetectorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      DetectorKind::Model => "model",
      DetectorKind::FullFrame => "full_frame",
    }
  }
}

impl std::fmt::Display for DetectorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 选择整帧回退的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
  NoWeights,
  WeightsMissing(PathBuf),
  LoadFailed(String),
}

impl std::fmt::Display for FallbackReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FallbackReason::NoWeights => write!(f, "未配置检测器权重"),
      FallbackReason::WeightsMissing(path) => write!(f, "检测器权重不存在: {}", path.display()),
      FallbackReason::LoadFailed(reason) => write!(f, "检测器加载失败: {}", reason),
    }
  }
}

pub struct OnnxDetector {
  session: Mutex<Session>,
  input_name: String,
}

impl OnnxDetector {
  pub fn new(session: Session) -> Result<Self, DetectError> {
    let input_name = input_names(&session)
      .into_iter()
      .next()
      .ok_or_else(|| DetectError::Output("模型没有输入".to_string()))?;
    Ok(Self {
      session: Mutex::new(session),
      input_name,
    })
  }

  fn preprocess(image: &RgbImage) -> Array4<f32> {
    let size = YOLO_INPUT_SIZE as usize;
    let resized = image::imageops::resize(image, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE, FilterType::Triangle);
    let mut input = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
      for c in 0..3 {
        input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
      }
    }
    input
  }

  fn detect(&self, image: &RgbImage) -> Result<DetectResult, DetectError> {
    let input = Value::from_array(Self::preprocess(image)).map_err(SessionError::runtime)?;

    let mut session = self.session.lock().map_err(|_| SessionError::Poisoned)?;
    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => input])
      .map_err(SessionError::runtime)?;
    let (shape, data) = outputs[0]
      .try_extract_tensor::<f32>()
      .map_err(SessionError::runtime)?;
    let shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();

    let scale = (
      image.width() as f32 / YOLO_INPUT_SIZE as f32,
      image.height() as f32 / YOLO_INPUT_SIZE as f32,
    );
    let items = decode_yolo_output(&shape, data, scale, image.width(), image.height())?;
    debug!("检测到 {} 个目标", items.len());
    Ok(items.into())
  }
}

pub enum VehicleDetector {
  Model(OnnxDetector),
  FullFrame { reason: FallbackReason },
}

impl VehicleDetector {
  /// 根据配置选择检测器形态
  pub fn from_config(config: &ModelConfig) -> Self {
    let Some(path) = config.detector_weights.as_ref() else {
      warn!("未配置检测器权重，使用整帧检测");
      return VehicleDetector::full_frame(FallbackReason::NoWeights);
    };
    if !path.is_file() {
      warn!("检测器权重不存在: {}，使用整帧检测", path.display());
      return VehicleDetector::full_frame(FallbackReason::WeightsMissing(path.clone()));
    }

    match build_session(path, config.device)
      .map_err(DetectError::from)
      .and_then(OnnxDetector::new)
    {
      Ok(detector) => {
        info!("检测器已加载: {}", path.display());
        VehicleDetector::Model(detector)
      }
      Err(e) => {
        warn!("检测器加载失败: {}，使用整帧检测", e);
        VehicleDetector::full_frame(FallbackReason::LoadFailed(e.to_string()))
      }
    }
  }

  pub fn full_frame(reason: FallbackReason) -> Self {
    VehicleDetector::FullFrame { reason }
  }

  pub fn kind(&self) -> DetectorKind {
    match self {
      VehicleDetector::Model(_) => DetectorKind::Model,
      VehicleDetector::FullFrame { .. } => DetectorKind::FullFrame,
    }
  }

  pub fn fallback_reason(&self) -> Option<&FallbackReason> {
    match self {
      VehicleDetector::Model(_) => None,
      VehicleDetector::FullFrame { reason } => Some(reason),
    }
  }
}

impl Model for VehicleDetector {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = DetectError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    match self {
      VehicleDetector::Model(detector) => detector.detect(input),
      VehicleDetector::FullFrame { .. } => Ok(full_frame_result(input.width(), input.height())),
    }
  }
}

impl FrameDetector for VehicleDetector {
  fn kind(&self) -> DetectorKind {
    VehicleDetector::kind(self)
  }
}

fn full_frame_result(width: u32, height: u32) -> DetectResult {
  vec![DetectItem {
    class_id: 0,
    score: FULL_FRAME_CONFIDENCE,
    bbox: BoundingBox::full_frame(width, height),
  }]
  .into()
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
  class_id: u32,
  score: f32,
  xyxy: [f32; 4],
}

/// 解码 YOLO 输出：阈值过滤、按类别 NMS，最后裁剪到画面范围并丢弃过小的框
pub(crate) fn decode_yolo_output(
  shape: &[usize],
  data: &[f32],
  scale: (f32, f32),
  width: u32,
  height: u32,
) -> Result<Vec<DetectItem>, DetectError> {
  let [batch, a, b] = shape else {
    return Err(DetectError::Output(format!("期望三维输出，实际为 {:?}", shape)));
  };
  if *batch < 1 || data.len() < a * b {
    return Err(DetectError::Output(format!(
      "输出大小不匹配: 形状 {:?}, 数据 {}",
      shape,
      data.len()
    )));
  }

  // 特征维通常远小于候选数
  let channels_first = a <= b;
  let (features, count) = if channels_first { (*a, *b) } else { (*b, *a) };
  if features < 5 {
    return Err(DetectError::Output(format!("特征维过小: {}", features)));
  }
  let at = |feature: usize, idx: usize| -> f32 {
    if channels_first {
      data[feature * count + idx]
    } else {
      data[idx * features + feature]
    }
  };

  let mut candidates = Vec::new();
  for idx in 0..count {
    let (class_id, score) = (4..features)
      .map(|f| (f - 4, at(f, idx)))
      .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
    if score.is_nan() || score < CONFIDENCE_THRESHOLD {
      continue;
    }

    let (cx, cy, w, h) = (at(0, idx), at(1, idx), at(2, idx), at(3, idx));
    candidates.push(Candidate {
      class_id: class_id as u32,
      score,
      xyxy: [
        (cx - w / 2.0) * scale.0,
        (cy - h / 2.0) * scale.1,
        (cx + w / 2.0) * scale.0,
        (cy + h / 2.0) * scale.1,
      ],
    });
  }

  Ok(
    nms(candidates, NMS_IOU_THRESHOLD)
      .into_iter()
      .filter_map(|c| {
        BoundingBox::clamped(c.xyxy, width, height).map(|bbox| DetectItem {
          class_id: c.class_id,
          score: c.score,
          bbox,
        })
      })
      .collect(),
  )
}

fn nms(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<Candidate> = Vec::new();
  for candidate in candidates {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == candidate.class_id && iou(&k.xyxy, &candidate.xyxy) >= threshold);
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// 按 [1, 4 + C, N] 排列候选框，候选数补零到大于特征维
  fn channels_first(rows: &[[f32; 6]]) -> (Vec<usize>, Vec<f32>) {
    let n = rows.len().max(8);
    let mut data = vec![0.0; 6 * n];
    for (i, row) in rows.iter().enumerate() {
      for (f, v) in row.iter().enumerate() {
        data[f * n + i] = *v;
      }
    }
    (vec![1, 6, n], data)
  }

  #[test]
  fn drops_low_confidence_and_tiny_boxes() {
    let (shape, data) = channels_first(&[
      [100.0, 100.0, 40.0, 40.0, 0.9, 0.1],
      [300.0, 300.0, 40.0, 40.0, 0.2, 0.1],
      [500.0, 500.0, 3.0, 40.0, 0.8, 0.0],
    ]);
    let items = decode_yolo_output(&shape, &data, (1.0, 1.0), 640, 640).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].bbox.to_array(), [80, 80, 120, 120]);
    assert!(items[0].score >= CONFIDENCE_THRESHOLD);
  }

  #[test]
  fn suppresses_overlaps_within_a_class_only() {
    let (shape, data) = channels_first(&[
      [100.0, 100.0, 40.0, 40.0, 0.9, 0.0],
      [102.0, 101.0, 40.0, 40.0, 0.7, 0.0],
      [101.0, 100.0, 40.0, 40.0, 0.0, 0.6],
    ]);
    let items = decode_yolo_output(&shape, &data, (1.0, 1.0), 640, 640).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].class_id, 0);
    assert_eq!(items[1].class_id, 1);
  }

  #[test]
  fn accepts_transposed_output_and_rescales() {
    let rows = [
      [320.0f32, 320.0, 64.0, 64.0, 0.0, 0.5],
      [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
      [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
      [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
      [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
      [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
      [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    ];
    let data: Vec<f32> = rows.iter().flatten().copied().collect();
    let items = decode_yolo_output(&[1, 7, 6], &data, (2.0, 0.5), 1280, 320).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].bbox.to_array(), [576, 144, 704, 176]);
  }

  #[test]
  fn boxes_are_clamped_to_frame() {
    let (shape, data) = channels_first(&[[10.0, 10.0, 60.0, 60.0, 0.9, 0.0]]);
    let items = decode_yolo_output(&shape, &data, (1.0, 1.0), 30, 30).unwrap();
    let bbox = items[0].bbox;
    assert!(bbox.x1 < bbox.x2 && bbox.x2 <= 30);
    assert!(bbox.y1 < bbox.y2 && bbox.y2 <= 30);
  }

  #[test]
  fn rejects_malformed_shape() {
    assert!(decode_yolo_output(&[1, 6], &[0.0; 6], (1.0, 1.0), 10, 10).is_err());
    assert!(decode_yolo_output(&[1, 6, 4], &[0.0; 3], (1.0, 1.0), 10, 10).is_err());
  }

  #[test]
  fn full_frame_detector_yields_one_box() {
    let detector = VehicleDetector::full_frame(FallbackReason::NoWeights);
    assert_eq!(detector.kind(), DetectorKind::FullFrame);
    let result = detector.infer(&RgbImage::new(64, 48)).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].score, FULL_FRAME_CONFIDENCE);
    assert_eq!(result.items[0].bbox.to_array(), [0, 0, 64, 48]);
  }

  #[test]
  fn missing_weights_select_full_frame() {
    let config = ModelConfig {
      detector_weights: Some(PathBuf::from("/no/such/yolo.onnx")),
      ..Default::default()
    };
    let detector = VehicleDetector::from_config(&config);
    assert_eq!(detector.kind(), DetectorKind::FullFrame);
    assert!(matches!(
      detector.fallback_reason(),
      Some(FallbackReason::WeightsMissing(_))
    ));
  }
}
