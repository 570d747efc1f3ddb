// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/classifier.rs - 图像分类模型
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

use std::sync::Arc;

use image::imageops::FilterType;
use ndarray::ArrayD;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl,
  frame::{Normalization, PixelGrid, TensorLayout},
  model::{Backend, ClassificationResult, Model, ModelError, ModelSource, Probabilities, Shape},
};

/// 分类模型的类别，顺序与模型输出一致
pub const CLASS_NAMES: [&str; 6] = [
  "Anthracnose",
  "Bacterial Wilt",
  "Downy-mildew",
  "Fresh",
  "Gummy Stem Blight",
  "Pawdery-mildew",
];

pub const CLASSIFIER_INPUT_SIZE: u32 = 224;

/// 模型输出被视为概率分布时允许的误差
const DISTRIBUTION_TOLERANCE: f32 = 1e-3;

/// 图像分类器，不设置置信度阈值，总是给出一个预测
pub struct Classifier {
  backend: Arc<dyn Backend>,
  class_names: Vec<String>,
  input_size: u32,
  layout: TensorLayout,
  normalization: Normalization,
}

impl std::fmt::Debug for Classifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Classifier")
      .field("class_names", &self.class_names)
      .field("input_size", &self.input_size)
      .field("layout", &self.layout)
      .field("normalization", &self.normalization)
      .finish()
  }
}

impl Classifier {
  /// Keras 导出的 MobileNetV3：NHWC 布局，像素范围 [0, 255]
  pub fn new(backend: Arc<dyn Backend>) -> Self {
    Self {
      backend,
      class_names: CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
      input_size: CLASSIFIER_INPUT_SIZE,
      layout: TensorLayout::Nhwc,
      normalization: Normalization::Byte,
    }
  }

  pub fn with_layout(mut self, layout: TensorLayout) -> Self {
    self.layout = layout;
    self
  }

  pub fn with_normalization(mut self, normalization: Normalization) -> Self {
    self.normalization = normalization;
    self
  }

  pub fn class_names(&self) -> &[String] {
    &self.class_names
  }

  /// (宽, 高)
  pub fn image_size(&self) -> (u32, u32) {
    (self.input_size, self.input_size)
  }

  /// 模型声明的输入形状；后端未提供时按预处理推断
  pub fn input_shape(&self) -> Shape {
    let shape = self.backend.input_shape();
    if !shape.is_empty() {
      return shape;
    }
    let size = Some(self.input_size as usize);
    match self.layout {
      TensorLayout::Nhwc => vec![None, size, size, Some(3)],
      TensorLayout::Nchw => vec![None, Some(3), size, size],
    }
  }

  pub fn output_shape(&self) -> Shape {
    let shape = self.backend.output_shape();
    if !shape.is_empty() {
      return shape;
    }
    vec![None, Some(self.class_names.len())]
  }

  fn preprocess(&self, grid: &PixelGrid) -> ArrayD<f32> {
    let resized = grid.resized(self.input_size, self.input_size, FilterType::CatmullRom);
    resized
      .to_tensor(self.layout, self.normalization)
      .into_dyn()
  }

  fn postprocess(&self, output: ArrayD<f32>) -> Result<ClassificationResult, ModelError> {
    let scores: Vec<f32> = output.iter().copied().collect();
    if scores.len() != self.class_names.len() {
      return Err(ModelError::inference(format!(
        "期望 {} 个类别分数，实际为 {}，输出形状 {:?}",
        self.class_names.len(),
        scores.len(),
        output.shape()
      )));
    }
    if scores.iter().any(|s| !s.is_finite()) {
      return Err(ModelError::inference("模型输出包含非有限值"));
    }

    let probabilities = if is_distribution(&scores) {
      scores
    } else {
      debug!("模型输出不是概率分布，使用 softmax 归一化");
      softmax(&scores)
    };

    let (index, confidence) = probabilities.iter().copied().enumerate().fold(
      (0usize, f32::MIN),
      |(best_idx, best), (idx, p)| {
        if p > best { (idx, p) } else { (best_idx, best) }
      },
    );

    let all_probabilities: Probabilities = self
      .class_names
      .iter()
      .cloned()
      .zip(probabilities.iter().copied())
      .collect();

    Ok(ClassificationResult {
      predicted_class: self.class_names[index].clone(),
      predicted_class_index: index,
      confidence,
      all_probabilities,
    })
  }
}

fn is_distribution(scores: &[f32]) -> bool {
  let sum: f32 = scores.iter().sum();
  scores.iter().all(|&s| s >= 0.0) && (sum - 1.0).abs() <= DISTRIBUTION_TOLERANCE
}

fn softmax(scores: &[f32]) -> Vec<f32> {
  let max = scores.iter().copied().fold(f32::MIN, f32::max);
  let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
  let sum: f32 = exps.iter().sum();
  exps.into_iter().map(|e| e / sum).collect()
}

impl Model for Classifier {
  type Input = PixelGrid;
  type Output = ClassificationResult;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("分类预处理: {:?} -> {}x{}", input.shape(), self.input_size, self.input_size);
    let tensor = self.preprocess(input);

    debug!("执行分类推理");
    let output = self.backend.forward(tensor)?;
    debug!("分类输出形状: {:?}", output.shape());

    let result = self.postprocess(output)?;
    debug!(
      "分类结果: {} ({:.4})",
      result.predicted_class, result.confidence
    );
    Ok(result)
  }
}

/// 由 `onnx:///path/model.onnx?range=byte&layout=nhwc` 构建分类器
pub struct ClassifierBuilder {
  source: ModelSource,
  layout: Option<TensorLayout>,
  normalization: Option<Normalization>,
}

impl FromUrl for ClassifierBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let source = ModelSource::from_url(url)?;
    let layout = source.option("layout")?;
    let normalization = source.option("range")?;
    Ok(ClassifierBuilder {
      source,
      layout,
      normalization,
    })
  }
}

impl ClassifierBuilder {
  pub fn build(self) -> Result<Classifier, ModelError> {
    info!("加载分类模型: {}", self.source.path().display());
    let backend = self.source.load_backend()?;
    let mut classifier = Classifier::new(backend);
    if let Some(layout) = self.layout {
      classifier = classifier.with_layout(layout);
    }
    if let Some(normalization) = self.normalization {
      classifier = classifier.with_normalization(normalization);
    }
    info!("分类模型加载完成: {:?}", classifier);
    Ok(classifier)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BackendError;
  use ndarray::{IxDyn, arr1};
  use std::sync::Mutex;

  fn fixed(scores: Vec<f32>) -> Arc<dyn Backend> {
    Arc::new(move |_input: ArrayD<f32>| -> Result<ArrayD<f32>, BackendError> {
      Ok(arr1(&scores).into_shape_with_order(IxDyn(&[1, scores.len()])).unwrap())
    })
  }

  #[test]
  fn picks_arg_max_and_keeps_class_order() {
    let classifier = Classifier::new(fixed(vec![0.05, 0.1, 0.6, 0.05, 0.1, 0.1]));
    let result = classifier.infer(&PixelGrid::filled(50, 30, [0, 128, 0])).unwrap();

    assert_eq!(result.predicted_class, "Downy-mildew");
    assert_eq!(result.predicted_class_index, 2);
    assert!((result.confidence - 0.6).abs() < 1e-6);
    let names: Vec<&str> = result.all_probabilities.keys().map(String::as_str).collect();
    assert_eq!(names, CLASS_NAMES.to_vec());
    let sum: f32 = result.all_probabilities.values().sum();
    assert!((sum - 1.0).abs() < 1e-3);
  }

  #[test]
  fn logits_are_normalised() {
    let classifier = Classifier::new(fixed(vec![-2.0, 4.0, 0.5, 1.0, 3.9, -7.0]));
    let result = classifier.infer(&PixelGrid::filled(8, 8, [1, 2, 3])).unwrap();
    assert_eq!(result.predicted_class, "Bacterial Wilt");
    let sum: f32 = result.all_probabilities.values().sum();
    assert!((sum - 1.0).abs() < 1e-3);
    assert!(result.all_probabilities.values().all(|&p| p > 0.0));
  }

  #[test]
  fn low_confidence_still_predicts() {
    let classifier = Classifier::new(fixed(vec![1.0 / 6.0; 6]));
    let result = classifier.infer(&PixelGrid::filled(4, 4, [0, 0, 0])).unwrap();
    assert_eq!(result.predicted_class_index, 0);
  }

  #[test]
  fn wrong_output_size_is_inference_error() {
    let classifier = Classifier::new(fixed(vec![0.5, 0.5]));
    let err = classifier.infer(&PixelGrid::filled(4, 4, [0, 0, 0])).unwrap_err();
    assert!(matches!(err, ModelError::Inference(_)));
  }

  #[test]
  fn feeds_keras_layout_and_range() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let backend = Arc::new(move |input: ArrayD<f32>| -> Result<ArrayD<f32>, BackendError> {
      let max = input.iter().copied().fold(f32::MIN, f32::max);
      captured.lock().unwrap().push((input.shape().to_vec(), max));
      Ok(ArrayD::from_elem(IxDyn(&[1, 6]), 1.0 / 6.0))
    });

    let classifier = Classifier::new(backend.clone());
    classifier.infer(&PixelGrid::filled(640, 480, [255, 255, 255])).unwrap();
    let nchw = Classifier::new(backend)
      .with_layout(TensorLayout::Nchw)
      .with_normalization(Normalization::Unit);
    nchw.infer(&PixelGrid::filled(10, 10, [255, 255, 255])).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].0, vec![1, 224, 224, 3]);
    assert!((seen[0].1 - 255.0).abs() < 1e-3);
    assert_eq!(seen[1].0, vec![1, 3, 224, 224]);
    assert!((seen[1].1 - 1.0).abs() < 1e-6);
  }

  #[test]
  fn backend_failure_propagates() {
    let failing = Arc::new(|_input: ArrayD<f32>| -> Result<ArrayD<f32>, BackendError> {
      Err(BackendError::NoOutput)
    });
    let err = Classifier::new(failing)
      .infer(&PixelGrid::filled(4, 4, [0, 0, 0]))
      .unwrap_err();
    assert!(matches!(err, ModelError::Backend(BackendError::NoOutput)));
  }

  #[test]
  fn declared_shapes_fall_back_to_preprocessing() {
    let classifier = Classifier::new(fixed(vec![0.0; 6]));
    assert_eq!(classifier.input_shape(), vec![None, Some(224), Some(224), Some(3)]);
    assert_eq!(classifier.output_shape(), vec![None, Some(6)]);
    assert_eq!(classifier.image_size(), (224, 224));
  }

  #[test]
  fn builder_reads_options() {
    let url = Url::parse("onnx:///m.onnx?layout=nchw&range=symmetric").unwrap();
    let builder = ClassifierBuilder::from_url(&url).unwrap();
    assert_eq!(builder.layout, Some(TensorLayout::Nchw));
    assert_eq!(builder.normalization, Some(Normalization::Symmetric));

    let url = Url::parse("onnx:///m.onnx?range=bogus").unwrap();
    assert!(ClassifierBuilder::from_url(&url).is_err());
  }
}
