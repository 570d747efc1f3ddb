// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::PixelGrid,
  model::{ClassificationResult, Detection, PresenceFlag, SegmentationResult},
  output::{
    Render, RenderError,
    draw::{Annotate, Draw},
  },
};

/// 把标注后的图像写到 `image:///path/out.jpg`，并在旁边写一份 JSON 结果记录
pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Draw<'static>,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("结果序列化错误: {0}")]
  RecordError(#[from] serde_json::Error),
  #[error("渲染错误: {0}")]
  RenderError(#[from] RenderError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: PathBuf::from(uri.path()),
      draw: Draw::new()?,
    })
  }
}

#[derive(Serialize)]
struct SegmentationRecord<'a> {
  detections: Vec<PresenceFlag>,
  presence_flags: &'a std::collections::BTreeSet<u8>,
  mask_width: usize,
  mask_height: usize,
}

impl SaveImageFileOutput {
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn sibling(&self, extension: &str) -> PathBuf {
    let mut name = self.path.file_stem().unwrap_or_default().to_os_string();
    name.push(extension);
    self.path.with_file_name(name)
  }

  fn save_image(&self, grid: &PixelGrid) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    grid.as_image().save(&self.path)?;
    info!("保存图像到文件: {}", self.path.display());
    Ok(())
  }

  fn save_record<T: Serialize + ?Sized>(&self, record: &T) -> Result<(), SaveImageFileError> {
    let path = self.sibling(".json");
    std::fs::write(&path, serde_json::to_vec_pretty(record)?)?;
    info!("保存结果记录: {}", path.display());
    Ok(())
  }
}

impl Render<PixelGrid, Vec<Detection>> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &PixelGrid, result: &Vec<Detection>) -> Result<(), Self::Error> {
    let annotated = self.draw.annotate(frame, result)?;
    self.save_image(&annotated)?;
    self.save_record(result)
  }
}

impl Render<PixelGrid, SegmentationResult> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &PixelGrid,
    result: &SegmentationResult,
  ) -> Result<(), Self::Error> {
    let overlay = self.draw.annotate(frame, result)?;
    self.save_image(&overlay)?;

    let mask_path = self.sibling(".mask.bin");
    std::fs::write(&mask_path, result.class_mask.as_bytes())?;
    info!("保存分割掩码: {}", mask_path.display());

    self.save_record(&SegmentationRecord {
      detections: result.flags(),
      presence_flags: &result.presence_flags,
      mask_width: result.class_mask.width(),
      mask_height: result.class_mask.height(),
    })
  }
}

impl Render<PixelGrid, ClassificationResult> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &PixelGrid,
    result: &ClassificationResult,
  ) -> Result<(), Self::Error> {
    self.save_image(frame)?;
    self.save_record(result)
  }
}
