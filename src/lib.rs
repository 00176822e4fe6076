// 该文件是 Xunche （寻车） 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod config;
pub mod frame;
pub mod gallery;
pub mod input;
pub mod job;
pub mod model;
pub mod output;
pub mod runner;
pub mod task;

pub use config::{Device, ModelConfig, StorageConfig};
pub use gallery::{GalleryIndex, GalleryMatch};
pub use runner::{Detection, ModelRunner, RunError, RunResult};

/// 四舍五入到 `digits` 位小数，序列化结果时使用
pub(crate) fn round_to(value: f64, digits: i32) -> f64 {
  let factor = 10f64.powi(digits);
  (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
  use super::round_to;

  #[test]
  fn rounds_to_requested_digits() {
    assert_eq!(round_to(1.23456, 2), 1.23);
    assert_eq!(round_to(1.23456, 3), 1.235);
  }
}
