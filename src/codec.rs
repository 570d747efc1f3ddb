// 该文件是 Kanjian （看见） 项目的一部分。
// src/codec.rs - 图像传输编解码
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

//! 传输字符串与像素网格之间的转换。
//!
//! 输入可以带 `data:image/jpeg;base64,` 这样的前缀，输出永远不带前缀。

use base64::{Engine, engine::general_purpose::STANDARD};
use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;
use tracing::debug;

use crate::frame::{ClassMask, PixelGrid};

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

const DATA_URI_PREFIX: &str = "data:";

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("图像数据为空")]
  Empty,
  #[error("Base64 解码错误: {0}")]
  InvalidBase64(#[from] base64::DecodeError),
  #[error("无法解析图像: {0}")]
  InvalidImage(image::ImageError),
  #[error("图像编码错误: {0}")]
  EncodeFailed(image::ImageError),
}

#[derive(Debug, Clone, Copy)]
pub struct Codec {
  quality: u8,
}

impl Default for Codec {
  fn default() -> Self {
    Self {
      quality: DEFAULT_JPEG_QUALITY,
    }
  }
}

impl Codec {
  /// JPEG 质量，取值 1-100
  pub fn with_quality(quality: u8) -> Self {
    Self {
      quality: quality.clamp(1, 100),
    }
  }

  pub fn quality(&self) -> u8 {
    self.quality
  }

  /// 传输字符串 -> RGB 像素网格
  pub fn decode(&self, input: &str) -> Result<PixelGrid, CodecError> {
    let payload = strip_data_uri(input);
    // Android 的 Base64.DEFAULT 每 76 个字符换行
    let cleaned: String = payload
      .chars()
      .filter(|c| !c.is_ascii_whitespace())
      .collect();
    if cleaned.is_empty() {
      return Err(CodecError::Empty);
    }

    let bytes = STANDARD.decode(cleaned.as_bytes())?;
    let image = image::load_from_memory(&bytes).map_err(CodecError::InvalidImage)?;
    debug!(
      "解码图像: {}x{} {:?}",
      image.width(),
      image.height(),
      image.color()
    );

    Ok(PixelGrid::from(image.to_rgb8()))
  }

  /// 像素网格 -> JPEG -> Base64，不带 data URI 前缀
  pub fn encode(&self, grid: &PixelGrid) -> Result<String, CodecError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, self.quality)
      .encode_image(grid.as_image())
      .map_err(CodecError::EncodeFailed)?;
    debug!("编码 JPEG: {} 字节", buffer.len());
    Ok(STANDARD.encode(&buffer))
  }

  /// 原始掩码字节（每像素一个字节，行优先）-> Base64
  pub fn encode_mask(&self, mask: &ClassMask) -> String {
    STANDARD.encode(mask.as_bytes())
  }
}

fn strip_data_uri(input: &str) -> &str {
  let trimmed = input.trim_start();
  if trimmed.starts_with(DATA_URI_PREFIX)
    && let Some((_, rest)) = trimmed.split_once(',')
  {
    return rest;
  }
  trimmed
}
