// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/segmenter.rs - UNet 语义分割模型
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

use std::{collections::BTreeSet, sync::Arc};

use image::imageops::FilterType;
use ndarray::{ArrayD, Axis, Ix3};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl,
  frame::{ClassMask, Normalization, PixelGrid, TensorLayout},
  model::{Backend, Model, ModelError, ModelSource, SegmentationResult},
};

/// 分割在固定分辨率上进行，掩码不会缩放回原图尺寸
pub const SEGMENTER_INPUT_SIZE: u32 = 256;

pub struct Segmenter {
  backend: Arc<dyn Backend>,
  input_size: u32,
}

impl std::fmt::Debug for Segmenter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Segmenter")
      .field("input_size", &self.input_size)
      .finish()
  }
}

impl Segmenter {
  pub fn new(backend: Arc<dyn Backend>) -> Self {
    Self {
      backend,
      input_size: SEGMENTER_INPUT_SIZE,
    }
  }

  /// 掩码分辨率 (宽, 高)
  pub fn resolution(&self) -> (u32, u32) {
    (self.input_size, self.input_size)
  }

  /// 缩放到固定尺寸，不保持长宽比
  pub fn prepare(&self, grid: &PixelGrid) -> PixelGrid {
    grid.resized(self.input_size, self.input_size, FilterType::CatmullRom)
  }

  fn postprocess(&self, output: ArrayD<f32>) -> Result<SegmentationResult, ModelError> {
    let shape = output.shape().to_vec();
    let size = self.input_size as usize;
    if shape.len() != 4 || shape[0] != 1 || shape[1] < 2 || shape[2] != size || shape[3] != size {
      return Err(ModelError::inference(format!(
        "期望分割输出形状为 [1, C>=2, {}, {}]，实际为 {:?}",
        size, size, shape
      )));
    }
    if shape[1] > u8::MAX as usize + 1 {
      return Err(ModelError::inference(format!("类别数过多: {}", shape[1])));
    }

    let scores = output
      .index_axis_move(Axis(0), 0)
      .into_dimensionality::<Ix3>()
      .map_err(|e| ModelError::inference(e.to_string()))?;

    let mut mask = ClassMask::new(size, size);
    let mut presence_flags = BTreeSet::new();
    for y in 0..size {
      for x in 0..size {
        // 逐像素取最大分数的类别，相等时取编号小的类别
        let mut best_class = 0usize;
        let mut best_score = scores[[0, y, x]];
        for c in 1..shape[1] {
          let score = scores[[c, y, x]];
          if score > best_score {
            best_score = score;
            best_class = c;
          }
        }
        mask.set(x, y, best_class as u8);
        presence_flags.insert(best_class as u8);
      }
    }

    Ok(SegmentationResult {
      class_mask: mask,
      presence_flags,
    })
  }
}

impl Model for Segmenter {
  type Input = PixelGrid;
  type Output = SegmentationResult;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let prepared = self.prepare(input);
    let tensor = prepared
      .to_tensor(TensorLayout::Nchw, Normalization::Unit)
      .into_dyn();

    debug!("执行分割推理");
    let output = self.backend.forward(tensor)?;
    debug!("分割输出形状: {:?}", output.shape());

    let result = self.postprocess(output)?;
    debug!("分割出现的类别: {:?}", result.presence_flags);
    Ok(result)
  }
}

/// 由 `onnx:///path/unet_segmentation.onnx` 构建分割模型
pub struct SegmenterBuilder {
  source: ModelSource,
}

impl FromUrl for SegmenterBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Ok(SegmenterBuilder {
      source: ModelSource::from_url(url)?,
    })
  }
}

impl SegmenterBuilder {
  pub fn build(self) -> Result<Segmenter, ModelError> {
    info!("加载分割模型: {}", self.source.path().display());
    let segmenter = Segmenter::new(self.source.load_backend()?);
    info!("分割模型加载完成");
    Ok(segmenter)
  }
}

/// 把亮度高于阈值的像素判为前景的测试模型
#[cfg(test)]
pub(crate) fn brightness_backend(threshold: f32) -> Arc<dyn Backend> {
  use crate::model::BackendError;
  use ndarray::{Array4, Ix4};

  Arc::new(
    move |input: ArrayD<f32>| -> Result<ArrayD<f32>, BackendError> {
      let input = input
        .into_dimensionality::<Ix4>()
        .map_err(|e| BackendError::Shape(e.to_string()))?;
      let (_, _, h, w) = input.dim();
      let out = Array4::from_shape_fn((1, 2, h, w), |(_, c, y, x)| {
        let brightness =
          (input[[0, 0, y, x]] + input[[0, 1, y, x]] + input[[0, 2, y, x]]) / 3.0;
        if c == 1 { brightness - threshold } else { threshold - brightness }
      });
      Ok(out.into_dyn())
    },
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BackendError;
  use ndarray::IxDyn;

  #[test]
  fn bright_region_is_foreground() {
    let mut grid = PixelGrid::filled(512, 512, [5, 5, 5]);
    for y in 128..384 {
      for x in 128..384 {
        grid.as_image_mut().put_pixel(x, y, image::Rgb([250, 250, 250]));
      }
    }

    let result = Segmenter::new(brightness_backend(0.5)).infer(&grid).unwrap();
    let mask = &result.class_mask;
    assert_eq!((mask.width(), mask.height()), (256, 256));
    assert!(mask.is_foreground(128, 128));
    assert!(!mask.is_foreground(10, 10));
    assert!(result.has_foreground());
    assert_eq!(result.presence_flags, BTreeSet::from([0, 1]));
    assert_eq!(result.flags().len(), 1);
    assert_eq!(result.flags()[0].class_name, "segmentation");
  }

  #[test]
  fn dark_image_has_no_presence_flag() {
    let result = Segmenter::new(brightness_backend(0.5))
      .infer(&PixelGrid::filled(100, 60, [0, 0, 0]))
      .unwrap();
    assert!(!result.class_mask.any_foreground());
    assert!(result.flags().is_empty());
  }

  #[test]
  fn ties_resolve_to_background() {
    let backend = Arc::new(|_input: ArrayD<f32>| -> Result<ArrayD<f32>, BackendError> {
      Ok(ArrayD::zeros(IxDyn(&[1, 2, 256, 256])))
    });
    let result = Segmenter::new(backend).infer(&PixelGrid::filled(4, 4, [0, 0, 0])).unwrap();
    assert!(!result.has_foreground());
  }

  #[test]
  fn wrong_resolution_is_rejected() {
    let backend = Arc::new(|_input: ArrayD<f32>| -> Result<ArrayD<f32>, BackendError> {
      Ok(ArrayD::zeros(IxDyn(&[1, 2, 128, 128])))
    });
    let err = Segmenter::new(backend)
      .infer(&PixelGrid::filled(4, 4, [0, 0, 0]))
      .unwrap_err();
    assert!(matches!(err, ModelError::Inference(_)));
  }
}
