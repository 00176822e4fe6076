// 该文件是 Xunche （寻车） 项目的一部分。
// src/runner.rs - 视频分析流程
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

//! # 视频分析流程
//!
//! [`ModelRunner`] 在进程启动时构建一次，之后以只读方式被所有任务共享。一次运行：
//!
//! 1. 打开视频，读取帧率（缺省 30）；
//! 2. 按步长采样，逐帧检测，检测结果连同裁剪图放入待处理批次；
//! 3. 批次满 `batch_size` 时提取特征、检索底库并生成检测记录；
//! 4. 帧循环结束后处理剩余批次，汇总耗时与指标。
//!
//! 同一帧的检测共用一张快照 `det_{帧序号}_{毫秒}.jpg`，帧的全部检测处理完后才写出，快照上画有这一帧的每个框。
//!
//! 单帧检测失败只会让这一帧没有检测结果；打开视频、写文件、特征提取失败会终止整次运行。

use std::{
  path::{Path, PathBuf},
  time::Instant,
};

use image::RgbImage;
use ndarray::Array2;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{Device, ModelConfig},
  frame::{BoundingBox, VideoFrame},
  gallery::{DEFAULT_TOPK, GalleryIndex, GalleryMatch},
  input::{FrameSampler, InputError, InputWrapper, VideoSource},
  model::{
    DetectResult, DetectorKind, ExtractError, FeatureExtractor, FrameDetector, Model,
    VehicleDetector, extractor::OrtBackbone,
  },
  output::{Annotation, ArtifactWriter, OutputError, Render, draw::Draw},
  round_to,
};

#[derive(Error, Debug)]
pub enum RunError {
  #[error("视频文件不存在: {0}")]
  VideoNotFound(PathBuf),
  #[error("视频输入错误: {0}")]
  Input(#[from] InputError),
  #[error("特征提取错误: {0}")]
  Extract(#[from] ExtractError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("I/O 错误 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// 一个保留下来的车辆检测
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
  /// 秒，保留三位小数
  pub timestamp: f64,
  pub bbox: BoundingBox,
  pub confidence: f64,
  #[serde(skip)]
  pub frame_index: usize,
  pub matches: Vec<GalleryMatch>,
  pub artifact_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
  pub frames_processed: usize,
  pub detections: usize,
  pub elapsed_sec: f64,
  pub gallery_size: usize,
  pub detector: DetectorKind,
  pub degraded_frames: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
  pub summary: String,
  pub frames_processed: usize,
  pub gallery_size: usize,
  pub metrics: RunMetrics,
  pub detections: Vec<Detection>,
}

/// 单帧检测结果
#[derive(Debug)]
pub enum FrameOutcome {
  Detected(DetectResult),
  /// 检测器出错，这一帧按零检测处理
  Degraded,
}

/// 等待批处理的检测
struct PendingDetection {
  frame: VideoFrame,
  bbox: BoundingBox,
  confidence: f32,
}

/// 收集当前帧的标注；检测按帧顺序到达，换帧时写出上一帧的快照
struct Snapshots<'a> {
  writer: ArtifactWriter<'a>,
  open: Option<(VideoFrame, Vec<Annotation>)>,
}

impl<'a> Snapshots<'a> {
  fn new(writer: ArtifactWriter<'a>) -> Self {
    Self { writer, open: None }
  }

  fn annotate(&mut self, frame: &VideoFrame, annotation: Annotation) -> Result<PathBuf, RunError> {
    if self
      .open
      .as_ref()
      .is_some_and(|(open, _)| open.index != frame.index)
    {
      self.finish()?;
    }
    let (_, annotations) = self.open.get_or_insert_with(|| (frame.clone(), Vec::new()));
    annotations.push(annotation);
    Ok(self.writer.path_for(frame))
  }

  fn finish(&mut self) -> Result<(), RunError> {
    if let Some((frame, annotations)) = self.open.take() {
      self.writer.render_result(&frame, annotations.as_slice())?;
    }
    Ok(())
  }
}

pub struct ModelRunner<D = VehicleDetector, E = FeatureExtractor<OrtBackbone>> {
  config: ModelConfig,
  detector: D,
  extractor: E,
  gallery: GalleryIndex,
  draw: Draw,
}

impl ModelRunner {
  /// 加载全部模型与底库，进程内只需调用一次
  pub fn from_config(config: ModelConfig) -> Result<Self, RunError> {
    let detector = VehicleDetector::from_config(&config);
    let extractor = FeatureExtractor::from_config(&config)?;
    let gallery = GalleryIndex::load(
      config.gallery_features.as_deref(),
      config.gallery_names.as_deref(),
    );
    let draw = Draw::load(config.label_font.as_deref());

    let runner = Self::new(config, detector, extractor, gallery, draw);
    info!(
      "分析器已初始化: 设备 {}, 检测器 {}, 底库 {} 条, 特征权重 {:?}",
      runner.device(),
      runner.detector_kind(),
      runner.gallery.size(),
      runner.extractor.status()
    );
    Ok(runner)
  }
}

impl<D, E> ModelRunner<D, E>
where
  D: FrameDetector,
  D::Error: std::fmt::Display,
  E: Model<Input = [RgbImage], Output = Array2<f32>, Error = ExtractError>,
{
  pub fn new(config: ModelConfig, detector: D, extractor: E, gallery: GalleryIndex, draw: Draw) -> Self {
    Self {
      config,
      detector,
      extractor,
      gallery,
      draw,
    }
  }

  pub fn config(&self) -> &ModelConfig {
    &self.config
  }

  pub fn device(&self) -> Device {
    self.config.device
  }

  pub fn gallery(&self) -> &GalleryIndex {
    &self.gallery
  }

  pub fn detector_kind(&self) -> DetectorKind {
    self.detector.kind()
  }

  /// 分析一个视频文件，快照写入 `artifacts_dir`
  pub fn run(&self, video: &Path, artifacts_dir: &Path) -> Result<RunResult, RunError> {
    if !video.exists() {
      return Err(RunError::VideoNotFound(video.to_path_buf()));
    }
    std::fs::create_dir_all(artifacts_dir).map_err(|source| RunError::Io {
      path: artifacts_dir.to_path_buf(),
      source,
    })?;

    let source = InputWrapper::open(video)?;
    let result = self.run_source(source, artifacts_dir)?;
    info!(
      "分析完成: {}, {} 帧, {} 个检测, 耗时 {} 秒",
      video.display(),
      result.metrics.frames_processed,
      result.metrics.detections,
      result.metrics.elapsed_sec
    );
    Ok(result)
  }

  /// 对已打开的视频源执行分析，`artifacts_dir` 需已存在
  pub fn run_source<S: VideoSource>(
    &self,
    source: S,
    artifacts_dir: &Path,
  ) -> Result<RunResult, RunError> {
    let started = Instant::now();
    let batch_size = self.config.batch();
    let sampler = FrameSampler::new(source, self.config.stride(), self.config.max_frames);
    debug!("视频帧率: {}", sampler.fps());
    let mut snapshots = Snapshots::new(ArtifactWriter::new(artifacts_dir, &self.draw));

    let mut pending: Vec<PendingDetection> = Vec::with_capacity(batch_size);
    let mut detections = Vec::new();
    let mut frames_processed = 0;
    let mut degraded_frames = 0;

    for frame in sampler {
      let frame = frame?;
      match self.detect_frame(&frame) {
        FrameOutcome::Detected(result) => {
          pending.extend(result.items.iter().map(|item| PendingDetection {
            frame: frame.clone(),
            bbox: item.bbox,
            confidence: item.score,
          }));
        }
        FrameOutcome::Degraded => degraded_frames += 1,
      }
      frames_processed += 1;

      while pending.len() >= batch_size {
        let batch: Vec<_> = pending.drain(..batch_size).collect();
        detections.extend(self.flush(batch, &mut snapshots)?);
      }
    }

    if !pending.is_empty() {
      detections.extend(self.flush(pending, &mut snapshots)?);
    }
    snapshots.finish()?;

    let elapsed = started.elapsed().as_secs_f64();
    let gallery_size = self.gallery.size();
    let summary = build_summary(frames_processed, detections.len(), elapsed, gallery_size);
    let metrics = RunMetrics {
      frames_processed,
      detections: detections.len(),
      elapsed_sec: round_to(elapsed, 2),
      gallery_size,
      detector: self.detector_kind(),
      degraded_frames,
    };

    Ok(RunResult {
      summary,
      frames_processed,
      gallery_size,
      metrics,
      detections,
    })
  }

  pub fn detect_frame(&self, frame: &VideoFrame) -> FrameOutcome {
    match self.detector.infer(frame.image.as_ref()) {
      Ok(result) => FrameOutcome::Detected(result),
      Err(e) => {
        warn!("第 {} 帧检测失败: {}", frame.index, e);
        FrameOutcome::Degraded
      }
    }
  }

  fn flush(
    &self,
    batch: Vec<PendingDetection>,
    snapshots: &mut Snapshots<'_>,
  ) -> Result<Vec<Detection>, RunError> {
    let crops: Vec<RgbImage> = batch.iter().map(|p| p.bbox.crop(&p.frame.image)).collect();
    let embeddings = self.extractor.infer(crops.as_slice())?;
    if embeddings.nrows() != batch.len() {
      return Err(
        ExtractError::Shape(format!(
          "特征行数不匹配: 期望 {}, 实际 {}",
          batch.len(),
          embeddings.nrows()
        ))
        .into(),
      );
    }
    let matches = self.gallery.batch_topk(&embeddings, DEFAULT_TOPK);
    debug!("处理批次: {} 个检测", batch.len());

    batch
      .into_iter()
      .zip(matches)
      .map(|(pending, matches)| -> Result<Detection, RunError> {
        let label = match matches.first() {
          Some(best) => best.name.clone(),
          None => format!("conf={:.2}", pending.confidence),
        };
        let annotation = Annotation {
          bbox: pending.bbox,
          label,
        };
        let artifact_path = snapshots.annotate(&pending.frame, annotation)?;

        Ok(Detection {
          timestamp: round_to(pending.frame.timestamp, 3),
          bbox: pending.bbox,
          confidence: round_to(pending.confidence as f64, 3),
          frame_index: pending.frame.index,
          matches: matches
            .into_iter()
            .map(|m| GalleryMatch {
              score: round_to(m.score as f64, 3) as f32,
              name: m.name,
            })
            .collect(),
          artifact_path: Some(artifact_path),
        })
      })
      .collect()
  }
}

fn build_summary(frames: usize, detections: usize, elapsed: f64, gallery_size: usize) -> String {
  if detections == 0 {
    return format!("Processed {} frames with no vehicle detections in {:.1}s.", frames, elapsed);
  }
  format!(
    "Processed {} frames and produced {} vehicle detections in {:.1}s with gallery size {}.",
    frames, detections, elapsed, gallery_size
  )
}
