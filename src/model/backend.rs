// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/backend.rs - 推理后端
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

use ndarray::ArrayD;
use thiserror::Error;

/// 张量形状，动态维度为 None
pub type Shape = Vec<Option<usize>>;

#[derive(Error, Debug)]
pub enum BackendError {
  #[cfg(feature = "onnx")]
  #[error("ONNX Runtime 错误: {0}")]
  Ort(#[from] ort::Error),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型没有输出")]
  NoOutput,
  #[error("张量形状错误: {0}")]
  Shape(String),
}

/// 已加载的模型句柄
///
/// 推理只读取权重，`forward` 取 `&self`，多个请求可以同时调用。
pub trait Backend: Send + Sync {
  fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>, BackendError>;

  fn input_shape(&self) -> Shape {
    Vec::new()
  }

  fn output_shape(&self) -> Shape {
    Vec::new()
  }

  /// 模型自带的元数据
  fn metadata(&self, _key: &str) -> Option<String> {
    None
  }
}

impl<F> Backend for F
where
  F: Fn(ArrayD<f32>) -> Result<ArrayD<f32>, BackendError> + Send + Sync,
{
  fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>, BackendError> {
    self(input)
  }
}

#[cfg(feature = "onnx")]
mod onnx {
  use std::path::Path;

  use ndarray::ArrayD;
  use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    value::{Tensor, ValueType},
  };
  use tracing::{debug, info, warn};

  use super::{Backend, BackendError, Shape};

  /// 基于 ONNX Runtime 的推理后端，单输入，取第一个输出
  pub struct OnnxBackend {
    session: Session,
    input_shape: Shape,
    output_shape: Shape,
  }

  impl std::fmt::Debug for OnnxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("OnnxBackend")
        .field("input_shape", &self.input_shape)
        .field("output_shape", &self.output_shape)
        .finish()
    }
  }

  impl OnnxBackend {
    pub fn load(path: &Path, threads: Option<usize>) -> Result<Self, BackendError> {
      info!("加载模型文件: {}", path.display());
      let size = std::fs::metadata(path)?.len();
      debug!("模型文件大小: {:.2} MB", size as f64 / (1024.0 * 1024.0));

      let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
      if let Some(threads) = threads {
        builder = builder.with_intra_threads(threads)?;
      }
      let session = builder.commit_from_file(path)?;

      let input_shape = session
        .inputs
        .first()
        .map(|input| dims_of(&input.input_type))
        .unwrap_or_default();
      let output_shape = session
        .outputs
        .first()
        .map(|output| dims_of(&output.output_type))
        .unwrap_or_default();

      debug!("模型输入数量: {}", session.inputs.len());
      debug!("模型输出数量: {}", session.outputs.len());
      debug!("模型输入形状: {:?}", input_shape);
      debug!("模型输出形状: {:?}", output_shape);

      Ok(Self {
        session,
        input_shape,
        output_shape,
      })
    }
  }

  fn dims_of(value_type: &ValueType) -> Shape {
    match value_type {
      ValueType::Tensor { dimensions, .. } => dimensions
        .iter()
        .map(|&d| usize::try_from(d).ok())
        .collect(),
      _ => Vec::new(),
    }
  }

  impl Backend for OnnxBackend {
    fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>, BackendError> {
      let tensor = Tensor::from_array(input)?;
      let outputs = self.session.run(ort::inputs![tensor]?)?;
      let output = outputs
        .iter()
        .next()
        .map(|(_name, value)| {
          value
            .try_extract_tensor::<f32>()
            .map(|view| view.into_owned())
        })
        .ok_or(BackendError::NoOutput)??;
      Ok(output)
    }

    fn input_shape(&self) -> Shape {
      self.input_shape.clone()
    }

    fn output_shape(&self) -> Shape {
      self.output_shape.clone()
    }

    fn metadata(&self, key: &str) -> Option<String> {
      match self
        .session
        .metadata()
        .and_then(|metadata| metadata.custom(key))
      {
        Ok(value) => value,
        Err(e) => {
          warn!("读取模型元数据 {} 失败: {}", key, e);
          None
        }
      }
    }
  }
}

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxBackend;
