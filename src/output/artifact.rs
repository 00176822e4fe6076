// 该文件是 Xunche （寻车） 项目的一部分。
// src/output/artifact.rs - 检测快照保存
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

use image::ImageFormat;
use tracing::debug;

use super::{Annotation, OutputError, Render, draw::Draw};
use crate::frame::VideoFrame;

/// `det_{帧序号:06}_{毫秒:07}.jpg`
pub fn artifact_file_name(frame_index: usize, timestamp_ms: u64) -> String {
  format!("det_{:06}_{:07}.jpg", frame_index, timestamp_ms)
}

pub struct ArtifactWriter<'a> {
  dir: PathBuf,
  draw: &'a Draw,
}

impl<'a> ArtifactWriter<'a> {
  pub fn new(dir: &Path, draw: &'a Draw) -> Self {
    Self {
      dir: dir.to_path_buf(),
      draw,
    }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// 某一帧快照的保存位置，同一帧的检测共用
  pub fn path_for(&self, frame: &VideoFrame) -> PathBuf {
    self
      .dir
      .join(artifact_file_name(frame.index, frame.timestamp_ms()))
  }
}

/// 一帧的全部检测画在同一张快照上
impl Render<VideoFrame, [Annotation]> for ArtifactWriter<'_> {
  type Output = PathBuf;
  type Error = OutputError;

  fn render_result(&self, frame: &VideoFrame, items: &[Annotation]) -> Result<PathBuf, OutputError> {
    let mut snapshot = frame.image.as_ref().clone();
    for item in items {
      self.draw.draw_annotation(&mut snapshot, item);
    }

    let path = self.path_for(frame);
    snapshot
      .save_with_format(&path, ImageFormat::Jpeg)
      .map_err(|source| match source {
        image::ImageError::IoError(source) => OutputError::IoError {
          path: path.clone(),
          source,
        },
        source => OutputError::ImageError {
          path: path.clone(),
          source,
        },
      })?;

    debug!("保存检测快照: {}", path.display());
    Ok(path)
  }
}

#[cfg(test)]
mod tests {
  use image::RgbImage;

  use super::*;
  use crate::frame::BoundingBox;

  #[test]
  fn file_name_is_zero_padded() {
    assert_eq!(artifact_file_name(45, 1500), "det_000045_0001500.jpg");
    assert_eq!(artifact_file_name(0, 0), "det_000000_0000000.jpg");
  }

  #[test]
  fn writes_jpeg_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let draw = Draw::default();
    let writer = ArtifactWriter::new(dir.path(), &draw);
    let frame = VideoFrame::new(30, 30.0, RgbImage::new(32, 24));
    let annotation = Annotation {
      bbox: BoundingBox::full_frame(32, 24),
      label: "conf=0.50".to_string(),
    };

    let path = writer.render_result(&frame, std::slice::from_ref(&annotation)).unwrap();
    assert_eq!(path, dir.path().join("det_000030_0001000.jpg"));
    assert_eq!(path, writer.path_for(&frame));
    let saved = image::open(&path).unwrap();
    assert_eq!((saved.width(), saved.height()), (32, 24));
  }

  #[test]
  fn several_boxes_share_one_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let draw = Draw::default();
    let writer = ArtifactWriter::new(dir.path(), &draw);
    let frame = VideoFrame::new(3, 30.0, RgbImage::new(64, 48));
    let annotations = [[2.0, 2.0, 20.0, 20.0], [30.0, 10.0, 60.0, 40.0]].map(|bbox| Annotation {
      bbox: BoundingBox::clamped(bbox, 64, 48).unwrap(),
      label: String::new(),
    });

    let path = writer.render_result(&frame, annotations.as_slice()).unwrap();
    assert_eq!(path, writer.path_for(&frame));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
  }

  #[test]
  fn missing_directory_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let draw = Draw::default();
    let writer = ArtifactWriter::new(&dir.path().join("gone"), &draw);
    let frame = VideoFrame::new(0, 30.0, RgbImage::new(8, 8));
    let annotation = Annotation {
      bbox: BoundingBox::full_frame(8, 8),
      label: String::new(),
    };
    assert!(writer.render_result(&frame, std::slice::from_ref(&annotation)).is_err());
  }
}
