// 该文件是 Kanjian （看见） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::PixelGrid};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 从 `image:///path/in.jpg` 读取一张图像，作为只产出一帧的迭代器
pub struct ImageFileInput {
  grid: Option<PixelGrid>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch(url.scheme().to_string()));
    }

    let image = ImageReader::open(url.path())?
      .with_guessed_format()?
      .decode()?
      .to_rgb8();
    debug!("读取图像 {}: {}x{}", url.path(), image.width(), image.height());

    Ok(ImageFileInput {
      grid: Some(PixelGrid::from(image)),
    })
  }
}

impl Iterator for ImageFileInput {
  type Item = PixelGrid;

  fn next(&mut self) -> Option<Self::Item> {
    self.grid.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yields_exactly_one_frame() {
    let path = std::env::temp_dir().join(format!("kanjian-input-{}.png", std::process::id()));
    PixelGrid::filled(20, 10, [1, 2, 3])
      .as_image()
      .save(&path)
      .unwrap();

    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    let frame = input.next().unwrap();
    assert_eq!(frame.shape(), (10, 20, 3));
    assert_eq!(frame.pixel(0, 0), [1, 2, 3]);
    assert!(input.next().is_none());
    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn missing_file_is_an_io_error() {
    let url = Url::parse("image:///no/such/kanjian/input.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::IoError(_))
    ));
  }
}
