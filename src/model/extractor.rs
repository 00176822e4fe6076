// 该文件是 Xunche （寻车） 项目的一部分。
// src/model/extractor.rs - 车辆特征提取
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

//! # 特征提取
//!
//! 每个裁剪图缩放到 256x256，按 ImageNet 均值方差归一化后送入骨干网络，
//! 输出按行做 L2 归一化。批大小只影响吞吐，不影响每一行的结果。

use std::{
  path::{Path, PathBuf},
  sync::Mutex,
};

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array2, Array4, Axis};
use ort::{session::Session, value::Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
  Model,
  session::{SessionError, build_session, input_names},
};
use crate::config::{Device, ModelConfig};

pub const EXTRACTOR_INPUT_SIZE: u32 = 256;
/// 空输入时返回矩阵的列数
pub const DEFAULT_FEATURE_DIM: usize = 2048;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const NORM_EPS: f32 = 1e-12;

/// 导出骨干网络时约定的输入名
const EXPECTED_INPUTS: [&str; 1] = ["input"];

#[derive(Error, Debug)]
pub enum ExtractError {
  #[error("会话错误: {0}")]
  Session(#[from] SessionError),
  #[error("特征形状错误: {0}")]
  Shape(String),
  #[error("没有可用的特征提取权重")]
  NoBackbone,
}

pub trait Backbone: Send + Sync {
  /// 输入 `[B, 3, H, W]`，输出 `[B, D]`
  fn forward(&self, batch: Array4<f32>) -> Result<Array2<f32>, ExtractError>;

  fn feature_dim(&self) -> usize {
    DEFAULT_FEATURE_DIM
  }
}

/// 权重加载结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsStatus {
  /// 自定义权重加载成功，输入名不一致只记录不报错
  Custom {
    path: PathBuf,
    missing_inputs: Vec<String>,
    unexpected_inputs: Vec<String>,
  },
  /// 使用通用预训练权重，`reason` 记录自定义权重未被使用的原因
  Generic {
    path: Option<PathBuf>,
    reason: Option<String>,
  },
}

impl WeightsStatus {
  pub fn is_custom(&self) -> bool {
    matches!(self, WeightsStatus::Custom { .. })
  }
}

pub struct OrtBackbone {
  session: Mutex<Session>,
  input_name: String,
}

impl OrtBackbone {
  pub fn load(path: &Path, device: Device) -> Result<Self, ExtractError> {
    let session = build_session(path, device)?;
    let input_name = input_names(&session)
      .into_iter()
      .next()
      .ok_or_else(|| ExtractError::Shape("模型没有输入".to_string()))?;
    Ok(Self {
      session: Mutex::new(session),
      input_name,
    })
  }

  /// 与约定输入名比较，返回 (缺失, 多余)
  fn compare_inputs(&self) -> (Vec<String>, Vec<String>) {
    let actual = self
      .session
      .lock()
      .map(|session| input_names(&session))
      .unwrap_or_else(|poisoned| input_names(&poisoned.into_inner()));
    let missing = EXPECTED_INPUTS
      .iter()
      .filter(|name| !actual.iter().any(|a| a == *name))
      .map(|name| name.to_string())
      .collect();
    let unexpected = actual
      .into_iter()
      .filter(|a| !EXPECTED_INPUTS.contains(&a.as_str()))
      .collect();
    (missing, unexpected)
  }
}

impl Backbone for OrtBackbone {
  fn forward(&self, batch: Array4<f32>) -> Result<Array2<f32>, ExtractError> {
    let rows = batch.len_of(Axis(0));
    let input = Value::from_array(batch).map_err(SessionError::runtime)?;

    let mut session = self.session.lock().map_err(|_| SessionError::Poisoned)?;
    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => input])
      .map_err(SessionError::runtime)?;
    let (shape, data) = outputs[0]
      .try_extract_tensor::<f32>()
      .map_err(SessionError::runtime)?;

    // [B, D] 或 [B, D, 1, 1]
    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    if dims.first() != Some(&rows) {
      return Err(ExtractError::Shape(format!(
        "输出批大小不匹配: 期望 {}, 形状 {:?}",
        rows, dims
      )));
    }
    let dim: usize = dims[1..].iter().product();
    Array2::from_shape_vec((rows, dim), data.to_vec()).map_err(|e| ExtractError::Shape(e.to_string()))
  }
}

pub struct FeatureExtractor<B> {
  backbone: B,
  batch_size: usize,
  status: WeightsStatus,
}

impl FeatureExtractor<OrtBackbone> {
  /// 优先加载自定义权重，失败时回落到通用骨干网络
  pub fn from_config(config: &ModelConfig) -> Result<Self, ExtractError> {
    let mut reason = None;

    if let Some(path) = config.extractor_weights.as_ref() {
      if path.is_file() {
        match OrtBackbone::load(path, config.device) {
          Ok(backbone) => {
            let (missing_inputs, unexpected_inputs) = backbone.compare_inputs();
            info!(
              "已加载自定义特征权重: {}, 缺失输入: {:?}, 多余输入: {:?}",
              path.display(),
              missing_inputs,
              unexpected_inputs
            );
            let status = WeightsStatus::Custom {
              path: path.clone(),
              missing_inputs,
              unexpected_inputs,
            };
            return Ok(Self::with_status(backbone, config.batch(), status));
          }
          Err(e) => {
            warn!("自定义特征权重加载失败，回落到通用权重: {}", e);
            reason = Some(e.to_string());
          }
        }
      } else {
        debug!("自定义特征权重不存在: {}", path.display());
        reason = Some(format!("权重文件不存在: {}", path.display()));
      }
    }

    let path = config.backbone_weights.as_ref().ok_or(ExtractError::NoBackbone)?;
    let backbone = OrtBackbone::load(path, config.device)?;
    info!("已加载通用特征权重: {}", path.display());
    let status = WeightsStatus::Generic {
      path: Some(path.clone()),
      reason,
    };
    Ok(Self::with_status(backbone, config.batch(), status))
  }
}

impl<B: Backbone> FeatureExtractor<B> {
  pub fn new(backbone: B, batch_size: usize) -> Self {
    let status = WeightsStatus::Generic {
      path: None,
      reason: None,
    };
    Self::with_status(backbone, batch_size, status)
  }

  pub fn with_status(backbone: B, batch_size: usize, status: WeightsStatus) -> Self {
    Self {
      backbone,
      batch_size: batch_size.max(1),
      status,
    }
  }

  pub fn status(&self) -> &WeightsStatus {
    &self.status
  }

  pub fn batch_size(&self) -> usize {
    self.batch_size
  }

  /// 每个裁剪图一行，保持输入顺序
  pub fn extract(&self, crops: &[RgbImage]) -> Result<Array2<f32>, ExtractError> {
    if crops.is_empty() {
      return Ok(Array2::zeros((0, self.backbone.feature_dim())));
    }

    let mut chunks = Vec::with_capacity(crops.len().div_ceil(self.batch_size));
    for chunk in crops.chunks(self.batch_size) {
      let features = self.backbone.forward(preprocess_batch(chunk))?;
      if features.nrows() != chunk.len() {
        return Err(ExtractError::Shape(format!(
          "特征行数不匹配: 期望 {}, 实际 {}",
          chunk.len(),
          features.nrows()
        )));
      }
      chunks.push(features);
    }

    let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
    let mut features =
      ndarray::concatenate(Axis(0), &views).map_err(|e| ExtractError::Shape(e.to_string()))?;
    l2_normalize_rows(&mut features);
    Ok(features)
  }
}

impl<B: Backbone> Model for FeatureExtractor<B> {
  type Input = [RgbImage];
  type Output = Array2<f32>;
  type Error = ExtractError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.extract(input)
  }
}

fn preprocess_batch(crops: &[RgbImage]) -> Array4<f32> {
  let size = EXTRACTOR_INPUT_SIZE as usize;
  let mut batch = Array4::<f32>::zeros((crops.len(), 3, size, size));
  for (n, crop) in crops.iter().enumerate() {
    let resized = image::imageops::resize(
      crop,
      EXTRACTOR_INPUT_SIZE,
      EXTRACTOR_INPUT_SIZE,
      FilterType::Triangle,
    );
    for (x, y, pixel) in resized.enumerate_pixels() {
      for c in 0..3 {
        let v = pixel[c] as f32 / 255.0;
        batch[[n, c, y as usize, x as usize]] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
      }
    }
  }
  batch
}

pub(crate) fn l2_normalize_rows(features: &mut Array2<f32>) {
  for mut row in features.rows_mut() {
    let norm = row.dot(&row).sqrt() + NORM_EPS;
    row.mapv_inplace(|v| v / norm);
  }
}
