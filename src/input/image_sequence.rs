// 该文件是 Xunche （寻车） 项目的一部分。
// src/input/image_sequence.rs - 图像序列输入
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

//! 把一个目录下的静态图片按文件名顺序当作视频帧读取。
//!
//! 目录中可以放置一个 `fps` 文本文件声明帧率，缺省时由采样器回落到默认帧率。

use std::{
  collections::VecDeque,
  path::{Path, PathBuf},
};

use image::{ImageReader, RgbImage};
use tracing::{debug, warn};

use super::{InputError, VideoSource};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
const FPS_FILE: &str = "fps";

pub struct ImageSequenceInput {
  frames: VecDeque<PathBuf>,
  fps: Option<f64>,
}

impl ImageSequenceInput {
  pub fn open(directory: &Path) -> Result<Self, InputError> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(directory)? {
      let path = entry?.path();
      let is_image = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
      if is_image && path.is_file() {
        frames.push(path);
      }
    }

    if frames.is_empty() {
      return Err(InputError::Open {
        path: directory.to_path_buf(),
        reason: "目录中没有图像帧".to_string(),
      });
    }
    frames.sort();

    let fps = Self::read_fps(directory);
    debug!("图像序列共 {} 帧, 帧率: {:?}", frames.len(), fps);

    Ok(Self {
      frames: frames.into(),
      fps,
    })
  }

  fn read_fps(directory: &Path) -> Option<f64> {
    let text = std::fs::read_to_string(directory.join(FPS_FILE)).ok()?;
    match text.trim().parse::<f64>() {
      Ok(fps) => Some(fps),
      Err(e) => {
        warn!("无法解析帧率文件: {}", e);
        None
      }
    }
  }

  pub fn len(&self) -> usize {
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }
}

impl Iterator for ImageSequenceInput {
  type Item = Result<RgbImage, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let path = self.frames.pop_front()?;
    let image = ImageReader::open(&path)
      .map_err(InputError::from)
      .and_then(|reader| reader.decode().map_err(InputError::from))
      .map(|image| image.to_rgb8());
    Some(image)
  }
}

impl VideoSource for ImageSequenceInput {
  fn fps(&self) -> Option<f64> {
    self.fps
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reads_frames_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    for (name, shade) in [("b.png", 20u8), ("a.png", 10), ("c.jpg", 30)] {
      RgbImage::from_pixel(6, 4, image::Rgb([shade, shade, shade]))
        .save(dir.path().join(name))
        .unwrap();
    }
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
    std::fs::write(dir.path().join("fps"), "12.5\n").unwrap();

    let input = ImageSequenceInput::open(dir.path()).unwrap();
    assert_eq!(input.len(), 3);
    assert_eq!(input.fps(), Some(12.5));

    let shades: Vec<u8> = input.map(|frame| frame.unwrap().get_pixel(0, 0)[0]).collect();
    assert_eq!(shades[0], 10);
    assert_eq!(shades[1], 20);
  }

  #[test]
  fn empty_directory_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      ImageSequenceInput::open(dir.path()),
      Err(InputError::Open { .. })
    ));
  }
}
