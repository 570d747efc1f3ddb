// 该文件是 Kanjian （看见） 项目的一部分。
// src/model.rs - 模型
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

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use crate::frame::ClassMask;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 三类模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModelKind {
  Classifier,
  Detector,
  Segmenter,
}

impl ModelKind {
  pub const ALL: [ModelKind; 3] = [
    ModelKind::Classifier,
    ModelKind::Detector,
    ModelKind::Segmenter,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      ModelKind::Classifier => "classifier",
      ModelKind::Detector => "detector",
      ModelKind::Segmenter => "segmenter",
    }
  }
}

impl std::fmt::Display for ModelKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型未就绪: {0}")]
  NotReady(ModelKind),
  #[error("模型已加载: {0}")]
  AlreadyLoaded(ModelKind),
  #[error("模型路径错误: {0}")]
  Scheme(String),
  #[error("模型参数错误: {0}")]
  InvalidOption(String),
  #[error("模型加载错误: {0}")]
  Load(String),
  #[error("推理后端错误: {0}")]
  Backend(#[from] BackendError),
  #[error("推理错误: {0}")]
  Inference(String),
}

impl ModelError {
  pub fn inference(msg: impl Into<String>) -> Self {
    ModelError::Inference(msg.into())
  }
}

/// 目标检测结果中的一个边界框，坐标为原图像素坐标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub xmin: i32,
  pub ymin: i32,
  pub xmax: i32,
  pub ymax: i32,
  pub confidence: f32,
  #[serde(rename = "class")]
  pub class_index: usize,
  #[serde(rename = "name")]
  pub class_name: String,
}

impl Detection {
  pub fn label(&self) -> String {
    format!("{} ({:.2})", self.class_name, self.confidence)
  }
}

/// 分割结果的存在标记，不是几何数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceFlag {
  #[serde(rename = "class")]
  pub class_index: usize,
  #[serde(rename = "name")]
  pub class_name: String,
}

pub const SEGMENTATION_FLAG_NAME: &str = "segmentation";

impl PresenceFlag {
  pub fn segmentation() -> Self {
    Self {
      class_index: 0,
      class_name: SEGMENTATION_FLAG_NAME.to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
  pub predicted_class: String,
  pub predicted_class_index: usize,
  pub confidence: f32,
  pub all_probabilities: Probabilities,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationResult {
  pub class_mask: ClassMask,
  pub presence_flags: BTreeSet<u8>,
}

impl SegmentationResult {
  pub fn has_foreground(&self) -> bool {
    self.presence_flags.iter().any(|&c| c != 0)
  }

  /// 有前景时返回一个合成的存在标记
  pub fn flags(&self) -> Vec<PresenceFlag> {
    if self.has_foreground() {
      vec![PresenceFlag::segmentation()]
    } else {
      Vec::new()
    }
  }
}

/// 按固定类别顺序保存的概率表
pub type Probabilities = IndexMap<String, f32>;

mod backend;
pub use self::backend::{Backend, BackendError, Shape};
#[cfg(feature = "onnx")]
pub use self::backend::OnnxBackend;

mod labels;
mod source;
pub use self::source::ModelSource;
pub use self::labels::{LabelTable, parse_ultralytics_names};

pub mod classifier;
pub mod detector;
pub mod segmenter;

pub use self::classifier::{CLASS_NAMES, Classifier, ClassifierBuilder};
pub use self::detector::{Detector, DetectorBuilder};
pub use self::segmenter::{Segmenter, SegmenterBuilder};
