// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/source.rs - 模型来源
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

use std::{collections::HashMap, path::PathBuf, str::FromStr, sync::Arc};

use tracing::error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{Backend, ModelError},
};

/// 形如 `onnx:///models/yolov8s.onnx?confidence=0.25` 的模型地址
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSource {
  path: PathBuf,
  options: HashMap<String, String>,
}

impl FromUrlWithScheme for ModelSource {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for ModelSource {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ModelError::Scheme(format!(
        "模型路径必须使用 {} 方案，实际为 {}",
        Self::SCHEME,
        url.scheme()
      )));
    }

    if url.path().is_empty() {
      return Err(ModelError::Scheme(format!("模型路径为空: {}", url)));
    }

    Ok(ModelSource {
      path: PathBuf::from(url.path()),
      options: url.query_pairs().into_owned().collect(),
    })
  }
}

impl ModelSource {
  pub fn path(&self) -> &std::path::Path {
    &self.path
  }

  pub fn raw_option(&self, key: &str) -> Option<&str> {
    self.options.get(key).map(String::as_str)
  }

  /// 读取并解析查询参数，不存在时返回 None
  pub fn option<T: FromStr>(&self, key: &str) -> Result<Option<T>, ModelError> {
    match self.options.get(key) {
      None => Ok(None),
      Some(value) => value
        .parse()
        .map(Some)
        .map_err(|_| ModelError::InvalidOption(format!("{}={}", key, value))),
    }
  }

  pub fn threads(&self) -> Result<Option<usize>, ModelError> {
    self.option("threads")
  }

  #[cfg(feature = "onnx")]
  pub fn load_backend(&self) -> Result<Arc<dyn Backend>, ModelError> {
    let backend = crate::model::OnnxBackend::load(&self.path, self.threads()?)
      .map_err(|e| ModelError::Load(format!("{}: {}", self.path.display(), e)))?;
    Ok(Arc::new(backend))
  }

  #[cfg(not(feature = "onnx"))]
  pub fn load_backend(&self) -> Result<Arc<dyn Backend>, ModelError> {
    Err(ModelError::Load(format!(
      "{}: 未启用 onnx 特性，无法加载模型",
      self.path.display()
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_path_and_options() {
    let url = Url::parse("onnx:///models/yolo.onnx?confidence=0.3&labels=/models/names%20list.txt")
      .unwrap();
    let source = ModelSource::from_url(&url).unwrap();
    assert_eq!(source.path(), std::path::Path::new("/models/yolo.onnx"));
    assert_eq!(source.option::<f32>("confidence").unwrap(), Some(0.3));
    assert_eq!(source.raw_option("labels"), Some("/models/names list.txt"));
    assert_eq!(source.option::<usize>("threads").unwrap(), None);
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("tflite:///models/detector.tflite").unwrap();
    assert!(matches!(
      ModelSource::from_url(&url),
      Err(ModelError::Scheme(_))
    ));
  }

  #[test]
  fn bad_option_value() {
    let url = Url::parse("onnx:///m.onnx?threads=many").unwrap();
    let source = ModelSource::from_url(&url).unwrap();
    assert!(matches!(
      source.threads(),
      Err(ModelError::InvalidOption(_))
    ));
  }

  #[test]
  fn missing_file_fails_to_load() {
    let url = Url::parse("onnx:///definitely/not/here.onnx").unwrap();
    let source = ModelSource::from_url(&url).unwrap();
    assert!(matches!(source.load_backend(), Err(ModelError::Load(_))));
  }
}
