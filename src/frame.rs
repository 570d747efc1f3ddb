// 该文件是 Kanjian （看见） 项目的一部分。
// src/frame.rs - 像素网格与类别掩码定义
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

use image::{RgbImage, imageops::FilterType};
use ndarray::Array4;

pub const RGB_CHANNELS: usize = 3;

/// 张量内存布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
  /// [1, H, W, C]
  Nhwc,
  /// [1, C, H, W]
  Nchw,
}

/// 像素值归一化方式，输入统一先缩放到 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
  /// [0, 1]
  Unit,
  /// [0, 255]，MobileNetV3 的 Keras 导出模型在图内自行缩放
  Byte,
  /// [-1, 1]
  Symmetric,
}

impl Normalization {
  #[inline]
  pub fn apply(self, value: u8) -> f32 {
    let unit = value as f32 / 255.0;
    match self {
      Normalization::Unit => unit,
      Normalization::Byte => unit * 255.0,
      Normalization::Symmetric => unit * 2.0 - 1.0,
    }
  }
}

impl std::str::FromStr for TensorLayout {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "nhwc" => Ok(TensorLayout::Nhwc),
      "nchw" => Ok(TensorLayout::Nchw),
      other => Err(format!("未知的张量布局: {}", other)),
    }
  }
}

impl std::str::FromStr for Normalization {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "unit" => Ok(Normalization::Unit),
      "byte" => Ok(Normalization::Byte),
      "symmetric" => Ok(Normalization::Symmetric),
      other => Err(format!("未知的归一化方式: {}", other)),
    }
  }
}

/// RGB 像素网格，形状为 (H, W, 3)
///
/// 组件之间只交换 RGB 顺序的网格，模型需要的通道顺序与布局只在推理适配器内部转换。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
  image: RgbImage,
}

impl From<RgbImage> for PixelGrid {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl PixelGrid {
  /// 以单一颜色创建网格
  pub fn filled(width: u32, height: u32, color: [u8; 3]) -> Self {
    Self {
      image: RgbImage::from_pixel(width, height, image::Rgb(color)),
    }
  }

  pub fn height(&self) -> usize {
    self.image.height() as usize
  }

  pub fn width(&self) -> usize {
    self.image.width() as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// (H, W, C)
  pub fn shape(&self) -> (usize, usize, usize) {
    (self.height(), self.width(), self.channels())
  }

  pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
    self.image.get_pixel(x, y).0
  }

  pub fn as_image(&self) -> &RgbImage {
    &self.image
  }

  pub fn as_image_mut(&mut self) -> &mut RgbImage {
    &mut self.image
  }

  pub fn into_image(self) -> RgbImage {
    self.image
  }

  /// 缩放到指定尺寸，尺寸一致时直接复制
  pub fn resized(&self, width: u32, height: u32, filter: FilterType) -> PixelGrid {
    if self.image.width() == width && self.image.height() == height {
      return self.clone();
    }
    PixelGrid {
      image: image::imageops::resize(&self.image, width, height, filter),
    }
  }

  /// 转换为批大小为 1 的浮点张量
  pub fn to_tensor(&self, layout: TensorLayout, norm: Normalization) -> Array4<f32> {
    let height = self.height();
    let width = self.width();

    match layout {
      TensorLayout::Nhwc => {
        Array4::from_shape_fn((1, height, width, RGB_CHANNELS), |(_, h, w, c)| {
          norm.apply(self.image.get_pixel(w as u32, h as u32)[c])
        })
      }
      TensorLayout::Nchw => {
        Array4::from_shape_fn((1, RGB_CHANNELS, height, width), |(_, c, h, w)| {
          norm.apply(self.image.get_pixel(w as u32, h as u32)[c])
        })
      }
    }
  }
}

/// 逐像素类别掩码，0 为背景，非 0 为前景
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMask {
  width: usize,
  height: usize,
  data: Box<[u8]>,
}

impl ClassMask {
  pub fn new(width: usize, height: usize) -> Self {
    Self {
      width,
      height,
      data: vec![0u8; width * height].into_boxed_slice(),
    }
  }

  /// 由行优先的数据创建掩码，长度不匹配时返回 None
  pub fn from_raw(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
    if data.len() != width * height {
      return None;
    }
    Some(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn get(&self, x: usize, y: usize) -> u8 {
    self.data[y * self.width + x]
  }

  pub fn set(&mut self, x: usize, y: usize, class_id: u8) {
    self.data[y * self.width + x] = class_id;
  }

  pub fn is_foreground(&self, x: usize, y: usize) -> bool {
    self.get(x, y) != 0
  }

  pub fn any_foreground(&self) -> bool {
    self.data.iter().any(|&c| c != 0)
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nchw_tensor_is_planar() {
    let mut grid = PixelGrid::filled(2, 1, [0, 0, 0]);
    grid.as_image_mut().put_pixel(1, 0, image::Rgb([255, 0, 51]));

    let tensor = grid.to_tensor(TensorLayout::Nchw, Normalization::Unit);
    assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
    assert_eq!(tensor[[0, 0, 0, 1]], 1.0);
    assert_eq!(tensor[[0, 1, 0, 1]], 0.0);
    assert!((tensor[[0, 2, 0, 1]] - 0.2).abs() < 1e-6);
    assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
  }

  #[test]
  fn nhwc_tensor_keeps_channels_last() {
    let grid = PixelGrid::filled(3, 2, [10, 20, 30]);
    let tensor = grid.to_tensor(TensorLayout::Nhwc, Normalization::Byte);
    assert_eq!(tensor.shape(), &[1, 2, 3, 3]);
    assert!((tensor[[0, 1, 2, 0]] - 10.0).abs() < 1e-4);
    assert!((tensor[[0, 1, 2, 2]] - 30.0).abs() < 1e-4);
  }

  #[test]
  fn symmetric_range() {
    assert_eq!(Normalization::Symmetric.apply(0), -1.0);
    assert_eq!(Normalization::Symmetric.apply(255), 1.0);
  }

  #[test]
  fn resized_same_size_is_identity() {
    let grid = PixelGrid::filled(4, 4, [1, 2, 3]);
    assert_eq!(grid.resized(4, 4, FilterType::Triangle), grid);
    assert_eq!(grid.resized(8, 2, FilterType::Triangle).shape(), (2, 8, 3));
  }

  #[test]
  fn mask_rejects_wrong_length() {
    assert!(ClassMask::from_raw(2, 2, vec![0; 3]).is_none());
    let mask = ClassMask::from_raw(2, 2, vec![0, 0, 1, 0]).unwrap();
    assert!(mask.is_foreground(0, 1));
    assert!(mask.any_foreground());
    assert!(!ClassMask::new(3, 3).any_foreground());
  }
}
