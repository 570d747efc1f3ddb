// 该文件是 Kanjian （看见） 项目的一部分。
// src/pipeline.rs - 请求处理流程
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

//! 每个端点的同步处理流程：校验、解码、推理、渲染、编码、封装。
//!
//! 流程本身不关心 HTTP，服务层把它放到阻塞线程上执行。
//! 错误信息属于线上协议，保持英文。

use std::{sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  codec::{Codec, CodecError},
  frame::PixelGrid,
  model::{
    ClassificationResult, Detection, Model, ModelError, ModelKind, PresenceFlag, Shape,
  },
  output::{Annotate, Draw, RenderError},
  registry::{LoadReport, ModelRegistry},
};

pub const NO_IMAGE_MESSAGE: &str = "No image data provided";
pub const INVALID_IMAGES_MESSAGE: &str = "Invalid images input";
const NOT_A_STRING_MESSAGE: &str = "Image data must be a base64 string";

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("{0}")]
  Validation(String),
  #[error("Failed to preprocess image: {0}")]
  Decode(#[source] CodecError),
  #[error("Model not loaded: {0}")]
  ModelNotReady(ModelKind),
  #[error("Failed to make prediction: {0}")]
  Inference(#[source] ModelError),
  #[error("Failed to render result: {0}")]
  Render(#[from] RenderError),
  #[error("Failed to encode result: {0}")]
  Encode(#[source] CodecError),
  #[error("Worker failed: {0}")]
  Worker(String),
}

impl PipelineError {
  /// 校验与解码失败由客户端造成，其余都是服务端错误
  pub fn is_client_fault(&self) -> bool {
    matches!(self, PipelineError::Validation(_) | PipelineError::Decode(_))
  }

  pub fn validation(msg: impl Into<String>) -> Self {
    PipelineError::Validation(msg.into())
  }
}

impl From<ModelError> for PipelineError {
  fn from(err: ModelError) -> Self {
    match err {
      ModelError::NotReady(kind) => PipelineError::ModelNotReady(kind),
      other => PipelineError::Inference(other),
    }
  }
}

/// 单张图像请求，`image` 为 base64，可带 data URI 前缀
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageRequest {
  #[serde(default)]
  pub image: Option<String>,
}

impl ImageRequest {
  pub fn new(image: impl Into<String>) -> Self {
    Self {
      image: Some(image.into()),
    }
  }
}

/// 批量分类请求，`images` 的合法性在流程中检查
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchRequest {
  #[serde(default)]
  pub images: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ClassifyResponse {
  pub success: bool,
  pub prediction: ClassificationResult,
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
  pub index: usize,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub prediction: Option<ClassificationResult>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
  pub success: bool,
  pub predictions: Vec<BatchItem>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
  pub input_shape: Shape,
  pub output_shape: Shape,
  pub num_classes: usize,
  pub class_names: Vec<String>,
  pub image_size: (u32, u32),
}

#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
  pub success: bool,
  pub model_info: ModelInfo,
}

#[derive(Debug, Serialize)]
pub struct DetectionResponse {
  pub success: bool,
  pub detections: Vec<Detection>,
  pub annotated_image: String,
}

#[derive(Debug, Serialize)]
pub struct SegmentationResponse {
  pub success: bool,
  pub detections: Vec<PresenceFlag>,
  pub annotated_image: String,
  pub mask: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
  pub status: &'static str,
  pub model_loaded: bool,
  pub models: LoadReport,
}

/// 失败时的统一响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub success: bool,
  pub error: String,
}

impl From<&PipelineError> for ErrorResponse {
  fn from(err: &PipelineError) -> Self {
    Self {
      success: false,
      error: err.to_string(),
    }
  }
}

pub struct Pipeline {
  registry: Arc<ModelRegistry>,
  draw: Draw<'static>,
  codec: Codec,
}

impl Pipeline {
  pub fn new(registry: Arc<ModelRegistry>, codec: Codec) -> Result<Self, RenderError> {
    Ok(Self {
      registry,
      draw: Draw::new()?,
      codec,
    })
  }

  pub fn registry(&self) -> &ModelRegistry {
    &self.registry
  }

  fn ensure_ready(&self, kind: ModelKind) -> Result<(), PipelineError> {
    if self.registry.is_ready(kind) {
      Ok(())
    } else {
      Err(PipelineError::ModelNotReady(kind))
    }
  }

  fn decode(&self, image: Option<&str>) -> Result<PixelGrid, PipelineError> {
    let image = image.ok_or_else(|| PipelineError::validation(NO_IMAGE_MESSAGE))?;
    let grid = self.codec.decode(image).map_err(PipelineError::Decode)?;
    debug!("解码图像: {:?}", grid.shape());
    Ok(grid)
  }

  fn classify_grid(&self, grid: &PixelGrid) -> Result<ClassificationResult, PipelineError> {
    let now = Instant::now();
    let prediction = self.registry.classifier().infer(grid)?;
    info!(
      "分类完成: {} ({:.4})，耗时: {:.2?}",
      prediction.predicted_class,
      prediction.confidence,
      now.elapsed()
    );
    Ok(prediction)
  }

  /// `/predict`
  pub fn classify(&self, request: &ImageRequest) -> Result<ClassifyResponse, PipelineError> {
    self.ensure_ready(ModelKind::Classifier)?;
    let grid = self.decode(request.image.as_deref())?;
    Ok(ClassifyResponse {
      success: true,
      prediction: self.classify_grid(&grid)?,
    })
  }

  /// `/predict_batch`，单个条目失败不会中断整批
  pub fn classify_batch(&self, request: &BatchRequest) -> Result<BatchResponse, PipelineError> {
    self.ensure_ready(ModelKind::Classifier)?;
    let Some(serde_json::Value::Array(images)) = &request.images else {
      return Err(PipelineError::validation(INVALID_IMAGES_MESSAGE));
    };

    info!("批量分类: {} 张图像", images.len());
    let predictions = images
      .iter()
      .enumerate()
      .map(|(index, item)| {
        let outcome = match item {
          serde_json::Value::String(image) => self
            .decode(Some(image))
            .and_then(|grid| self.classify_grid(&grid)),
          _ => Err(PipelineError::validation(NOT_A_STRING_MESSAGE)),
        };
        match outcome {
          Ok(prediction) => BatchItem {
            index,
            success: true,
            prediction: Some(prediction),
            error: None,
          },
          Err(e) => {
            warn!("批量分类第 {} 项失败: {}", index, e);
            BatchItem {
              index,
              success: false,
              prediction: None,
              error: Some(e.to_string()),
            }
          }
        }
      })
      .collect();

    Ok(BatchResponse {
      success: true,
      predictions,
    })
  }

  /// `/model_info`，描述分类模型
  pub fn model_info(&self) -> Result<ModelInfoResponse, PipelineError> {
    let classifier = self.registry.classifier().get()?;
    let class_names = classifier.class_names().to_vec();
    Ok(ModelInfoResponse {
      success: true,
      model_info: ModelInfo {
        input_shape: classifier.input_shape(),
        output_shape: classifier.output_shape(),
        num_classes: class_names.len(),
        class_names,
        image_size: classifier.image_size(),
      },
    })
  }

  /// `/predict_detection`，框画在原分辨率的副本上
  pub fn detect(&self, request: &ImageRequest) -> Result<DetectionResponse, PipelineError> {
    let grid = self.decode(request.image.as_deref())?;

    let now = Instant::now();
    let detections = self.registry.detector().infer(&grid)?;
    info!(
      "检测完成: {} 个目标，耗时: {:.2?}",
      detections.len(),
      now.elapsed()
    );

    let annotated = self.draw.annotate(&grid, &detections)?;
    let annotated_image = self.codec.encode(&annotated).map_err(PipelineError::Encode)?;

    Ok(DetectionResponse {
      success: true,
      detections,
      annotated_image,
    })
  }

  /// `/predict_segmentation`，叠加图与掩码都是分割分辨率
  pub fn segment(&self, request: &ImageRequest) -> Result<SegmentationResponse, PipelineError> {
    let grid = self.decode(request.image.as_deref())?;

    let now = Instant::now();
    let result = self.registry.segmenter().infer(&grid)?;
    info!(
      "分割完成: 类别 {:?}，耗时: {:.2?}",
      result.presence_flags,
      now.elapsed()
    );

    let overlay = self.draw.annotate(&grid, &result)?;
    let annotated_image = self.codec.encode(&overlay).map_err(PipelineError::Encode)?;
    let mask = self.codec.encode_mask(&result.class_mask);
    debug!(
      "分割响应大小: 图像 {} 字符, 掩码 {} 字符",
      annotated_image.len(),
      mask.len()
    );

    Ok(SegmentationResponse {
      success: true,
      detections: result.flags(),
      annotated_image,
      mask,
    })
  }

  /// `/health`，始终成功
  pub fn health(&self) -> HealthResponse {
    HealthResponse {
      status: "healthy",
      model_loaded: self.registry.is_ready(ModelKind::Classifier),
      models: self.registry.report(),
    }
  }
}
