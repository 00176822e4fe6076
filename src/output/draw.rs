// 该文件是 Xunche （寻车） 项目的一部分。
// src/output/draw.rs - 检测框与标签绘制
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

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use tracing::{debug, warn};

use super::Annotation;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_OFFSET: i32 = 10;
const BOX_THICKNESS: i32 = 2;
const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

/// 未指定字体时依次尝试的系统字体
const SYSTEM_FONTS: [&str; 3] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
];

pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
  box_color: [u8; 3],
  text_color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self::with_font(None)
  }
}

impl Draw {
  pub fn with_font(font: Option<FontVec>) -> Self {
    Self {
      font,
      font_size: LABEL_FONT_SIZE,
      box_color: BOX_COLOR,
      text_color: TEXT_COLOR,
    }
  }

  /// 加载标签字体；没有可用字体时只画框
  pub fn load(font_path: Option<&Path>) -> Self {
    let candidates: Vec<PathBuf> = match font_path {
      Some(path) => vec![path.to_path_buf()],
      None => SYSTEM_FONTS.iter().map(PathBuf::from).collect(),
    };

    for path in candidates.iter().filter(|p| p.is_file()) {
      match std::fs::read(path).map(FontVec::try_from_vec) {
        Ok(Ok(font)) => {
          debug!("标签字体: {}", path.display());
          return Self::with_font(Some(font));
        }
        Ok(Err(e)) => warn!("无法解析字体 {}: {}", path.display(), e),
        Err(e) => warn!("无法读取字体 {}: {}", path.display(), e),
      }
    }

    warn!("没有可用的标签字体，快照中只绘制检测框");
    Self::with_font(None)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn draw_annotation(&self, image: &mut RgbImage, annotation: &Annotation) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let bbox = annotation.bbox;
    let (x_min, y_min) = (bbox.x1 as i32, bbox.y1 as i32);
    let (box_w, box_h) = (bbox.width() as i32, bbox.height() as i32);

    // 向内加粗，保证边框不越过画面
    for t in 0..BOX_THICKNESS {
      let (rw, rh) = (box_w - 2 * t, box_h - 2 * t);
      if rw <= 0 || rh <= 0 || x_min + t >= w || y_min + t >= h {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(rw as u32, rh as u32);
      draw_hollow_rect_mut(image, rect, Rgb(self.box_color));
    }

    let Some(font) = self.font.as_ref() else {
      return;
    };
    if annotation.label.is_empty() {
      return;
    }

    let scale = PxScale::from(self.font_size);
    let (text_w, text_h) = text_size(scale, font, &annotation.label);
    let label_h = text_h as i32 + 2 * LABEL_TEXT_VERTICAL_PADDING;
    let label_x = x_min;
    let label_y = (y_min - LABEL_OFFSET - label_h).max(0);
    let label_w = (text_w as i32).min(w - label_x);

    if label_w > 0 && label_h > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_w as u32, label_h as u32);
      draw_filled_rect_mut(image, rect, Rgb(self.box_color));
      draw_text_mut(
        image,
        Rgb(self.text_color),
        label_x,
        label_y + LABEL_TEXT_VERTICAL_PADDING,
        scale,
        font,
        &annotation.label,
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::BoundingBox;

  #[test]
  fn draws_box_edges_without_font() {
    let mut image = RgbImage::new(40, 30);
    let annotation = Annotation {
      bbox: BoundingBox::clamped([5.0, 5.0, 25.0, 20.0], 40, 30).unwrap(),
      label: "sedan".to_string(),
    };
    Draw::with_font(None).draw_annotation(&mut image, &annotation);

    assert_eq!(image.get_pixel(5, 5), &Rgb(BOX_COLOR));
    assert_eq!(image.get_pixel(6, 6), &Rgb(BOX_COLOR));
    assert_eq!(image.get_pixel(24, 19), &Rgb(BOX_COLOR));
    assert_eq!(image.get_pixel(15, 12), &Rgb([0, 0, 0]));
  }

  #[test]
  fn full_frame_box_stays_in_bounds() {
    let mut image = RgbImage::new(16, 16);
    let annotation = Annotation {
      bbox: BoundingBox::full_frame(16, 16),
      label: String::new(),
    };
    Draw::default().draw_annotation(&mut image, &annotation);
    assert_eq!(image.get_pixel(15, 15), &Rgb(BOX_COLOR));
  }

  #[test]
  fn missing_font_file_falls_back() {
    let draw = Draw::load(Some(Path::new("/no/such/font.ttf")));
    assert!(!draw.has_font());
  }
}
