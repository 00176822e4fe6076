// 该文件是 Xunche （寻车） 项目的一部分。
// src/gallery.rs - 底库索引
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

//! # 底库索引
//!
//! 底库由两个文件组成：`.npy` 特征矩阵 `[N, D]`（f32 或 f64）和名称列表
//! （JSON 字符串数组，或每行一个名称的文本）。加载失败不会报错，索引只是处于未就绪状态，
//! 此时所有查询都返回空列表。
//!
//! 相似度相同时按名称升序、再按底库顺序排序，保证结果稳定。

use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView1};
use ndarray_npy::{ReadNpyError, read_npy};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::extractor::l2_normalize_rows;

pub const DEFAULT_TOPK: usize = 3;

const NORM_EPS: f32 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryMatch {
  pub name: String,
  pub score: f32,
}

#[derive(Error, Debug)]
pub enum GalleryError {
  #[error("读取特征文件失败: {0}")]
  Npy(#[from] ReadNpyError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("名称列表格式错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("特征数 {features} 与名称数 {names} 不一致")]
  Mismatch { features: usize, names: usize },
  #[error("底库为空")]
  Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GalleryStatus {
  Ready,
  /// 未配置或文件不存在
  Missing(Option<PathBuf>),
  Mismatch { features: usize, names: usize },
  Invalid(String),
}

impl std::fmt::Display for GalleryStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      GalleryStatus::Ready => write!(f, "ready"),
      GalleryStatus::Missing(Some(path)) => write!(f, "missing: {}", path.display()),
      GalleryStatus::Missing(None) => write!(f, "missing"),
      GalleryStatus::Mismatch { features, names } => {
        write!(f, "mismatch: {} features, {} names", features, names)
      }
      GalleryStatus::Invalid(reason) => write!(f, "invalid: {}", reason),
    }
  }
}

#[derive(Debug, Clone)]
pub struct GalleryIndex {
  features: Option<Array2<f32>>,
  names: Vec<String>,
  status: GalleryStatus,
}

impl GalleryIndex {
  /// 加载底库，任何失败都降级为未就绪
  pub fn load(features_path: Option<&Path>, names_path: Option<&Path>) -> Self {
    let Some(features_path) = features_path.filter(|p| p.is_file()) else {
      warn!("底库特征文件不存在: {:?}，相似度检索已禁用", features_path);
      return Self::not_ready(GalleryStatus::Missing(features_path.map(Path::to_path_buf)));
    };
    let Some(names_path) = names_path.filter(|p| p.is_file()) else {
      warn!("底库名称文件不存在: {:?}，相似度检索已禁用", names_path);
      return Self::not_ready(GalleryStatus::Missing(names_path.map(Path::to_path_buf)));
    };

    let loaded = read_features(features_path)
      .and_then(|features| Ok((features, read_names(names_path)?)))
      .and_then(|(features, names)| Self::from_parts(features, names));
    match loaded {
      Ok(index) => {
        info!(
          "底库已加载: {} ({} 条, {} 维)",
          features_path.display(),
          index.size(),
          index.dim()
        );
        index
      }
      Err(GalleryError::Mismatch { features, names }) => {
        warn!("底库特征数 {} 与名称数 {} 不一致", features, names);
        Self::not_ready(GalleryStatus::Mismatch { features, names })
      }
      Err(e) => {
        warn!("底库加载失败: {}", e);
        Self::not_ready(GalleryStatus::Invalid(e.to_string()))
      }
    }
  }

  /// 由内存中的特征与名称构建，特征会按行归一化；没有任何条目时报错
  pub fn from_parts(mut features: Array2<f32>, names: Vec<String>) -> Result<Self, GalleryError> {
    if features.nrows() != names.len() {
      return Err(GalleryError::Mismatch {
        features: features.nrows(),
        names: names.len(),
      });
    }
    if names.is_empty() {
      return Err(GalleryError::Empty);
    }
    l2_normalize_rows(&mut features);
    Ok(Self {
      features: Some(features),
      names,
      status: GalleryStatus::Ready,
    })
  }

  pub fn not_ready(status: GalleryStatus) -> Self {
    Self {
      features: None,
      names: Vec::new(),
      status,
    }
  }

  pub fn size(&self) -> usize {
    self.features.as_ref().map_or(0, |f| f.nrows())
  }

  pub fn dim(&self) -> usize {
    self.features.as_ref().map_or(0, |f| f.ncols())
  }

  pub fn is_ready(&self) -> bool {
    self.features.is_some() && !self.names.is_empty()
  }

  pub fn status(&self) -> &GalleryStatus {
    &self.status
  }

  /// 按余弦相似度降序返回至多 k 个匹配
  pub fn topk(&self, query: ArrayView1<f32>, k: usize) -> Vec<GalleryMatch> {
    let Some(features) = self.features.as_ref().filter(|_| self.is_ready()) else {
      return Vec::new();
    };
    if query.is_empty() || k == 0 {
      return Vec::new();
    }
    if query.len() != features.ncols() {
      warn!("查询维度 {} 与底库维度 {} 不一致", query.len(), features.ncols());
      return Vec::new();
    }

    let norm = query.dot(&query).sqrt() + NORM_EPS;
    let scores = features.dot(&query) / norm;

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
      scores[b]
        .total_cmp(&scores[a])
        .then_with(|| self.names[a].cmp(&self.names[b]))
        .then(a.cmp(&b))
    });

    order
      .into_iter()
      .take(k)
      .map(|i| GalleryMatch {
        name: self.names[i].clone(),
        score: scores[i],
      })
      .collect()
  }

  /// 逐行查询，保持行顺序
  pub fn batch_topk(&self, queries: &Array2<f32>, k: usize) -> Vec<Vec<GalleryMatch>> {
    queries.rows().into_iter().map(|row| self.topk(row, k)).collect()
  }
}

fn read_features(path: &Path) -> Result<Array2<f32>, GalleryError> {
  match read_npy::<_, Array2<f32>>(path) {
    Ok(features) => Ok(features),
    Err(first) => match read_npy::<_, Array2<f64>>(path) {
      Ok(features) => Ok(features.mapv(|v| v as f32)),
      Err(_) => Err(first.into()),
    },
  }
}

fn read_names(path: &Path) -> Result<Vec<String>, GalleryError> {
  let text = std::fs::read_to_string(path)?;
  let trimmed = text.trim_start();
  if trimmed.starts_with('[') {
    return Ok(serde_json::from_str(trimmed)?);
  }
  Ok(
    text
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect(),
  )
}
