// 该文件是 Xunche （寻车） 项目的一部分。
// src/output.rs - 检测结果输出
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

use thiserror::Error;

use crate::frame::BoundingBox;

pub trait Render<Frame, Item: ?Sized> {
  type Output;
  type Error;

  fn render_result(&self, frame: &Frame, item: &Item) -> Result<Self::Output, Self::Error>;
}

/// 需要标注在快照上的一个检测
#[derive(Debug, Clone)]
pub struct Annotation {
  pub bbox: BoundingBox,
  pub label: String,
}

pub mod draw;

mod artifact;
pub use self::artifact::{ArtifactWriter, artifact_file_name};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误 {path}: {source}")]
  IoError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("图像编码错误 {path}: {source}")]
  ImageError {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
}
