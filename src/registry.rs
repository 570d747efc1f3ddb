// 该文件是 Kanjian （看见） 项目的一部分。
// src/registry.rs - 模型生命周期管理
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

//! 三个模型在启动时各加载一次，之后只读共享。
//!
//! 每个模型放在一个只能写入一次的槽位里，槽位为空时推理返回 [`ModelError::NotReady`]。

use std::{collections::BTreeMap, sync::OnceLock, time::Instant};

use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl,
  model::{
    Classifier, ClassifierBuilder, Detector, DetectorBuilder, Model, ModelError, ModelKind,
    Segmenter, SegmenterBuilder,
  },
};

/// 只写一次的模型槽位
#[derive(Debug)]
pub struct ModelSlot<M> {
  kind: ModelKind,
  model: OnceLock<M>,
}

impl<M> ModelSlot<M> {
  pub fn new(kind: ModelKind) -> Self {
    Self {
      kind,
      model: OnceLock::new(),
    }
  }

  pub fn kind(&self) -> ModelKind {
    self.kind
  }

  pub fn is_ready(&self) -> bool {
    self.model.get().is_some()
  }

  pub fn get(&self) -> Result<&M, ModelError> {
    self.model.get().ok_or(ModelError::NotReady(self.kind))
  }

  /// 写入模型，槽位已被占用时返回错误
  pub fn install(&self, model: M) -> Result<(), ModelError> {
    self
      .model
      .set(model)
      .map_err(|_| ModelError::AlreadyLoaded(self.kind))
  }
}

impl<M> Model for ModelSlot<M>
where
  M: Model<Error = ModelError>,
{
  type Input = M::Input;
  type Output = M::Output;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.get()?.infer(input)
  }
}

/// 三个模型的地址，未配置的模型不会加载
#[derive(Debug, Clone, Default)]
pub struct ModelSources {
  pub classifier: Option<Url>,
  pub detector: Option<Url>,
  pub segmenter: Option<Url>,
}

impl ModelSources {
  fn get(&self, kind: ModelKind) -> Option<&Url> {
    match kind {
      ModelKind::Classifier => self.classifier.as_ref(),
      ModelKind::Detector => self.detector.as_ref(),
      ModelKind::Segmenter => self.segmenter.as_ref(),
    }
  }
}

/// 每个模型是否加载成功
pub type LoadReport = BTreeMap<&'static str, bool>;

#[derive(Debug)]
pub struct ModelRegistry {
  classifier: ModelSlot<Classifier>,
  detector: ModelSlot<Detector>,
  segmenter: ModelSlot<Segmenter>,
}

impl Default for ModelRegistry {
  fn default() -> Self {
    Self {
      classifier: ModelSlot::new(ModelKind::Classifier),
      detector: ModelSlot::new(ModelKind::Detector),
      segmenter: ModelSlot::new(ModelKind::Segmenter),
    }
  }
}

impl ModelRegistry {
  pub fn classifier(&self) -> &ModelSlot<Classifier> {
    &self.classifier
  }

  pub fn detector(&self) -> &ModelSlot<Detector> {
    &self.detector
  }

  pub fn segmenter(&self) -> &ModelSlot<Segmenter> {
    &self.segmenter
  }

  pub fn is_ready(&self, kind: ModelKind) -> bool {
    match kind {
      ModelKind::Classifier => self.classifier.is_ready(),
      ModelKind::Detector => self.detector.is_ready(),
      ModelKind::Segmenter => self.segmenter.is_ready(),
    }
  }

  pub fn report(&self) -> LoadReport {
    ModelKind::ALL
      .iter()
      .map(|kind| (kind.name(), self.is_ready(*kind)))
      .collect()
  }

  pub fn all_ready(&self) -> bool {
    ModelKind::ALL.iter().all(|kind| self.is_ready(*kind))
  }

  /// 依次加载三个模型，一个失败不影响其余模型的加载
  pub fn load_all(&self, sources: &ModelSources) -> LoadReport {
    self.load_each(sources, |kind, url| self.load(kind, url))
  }

  fn load_each<F>(&self, sources: &ModelSources, mut loader: F) -> LoadReport
  where
    F: FnMut(ModelKind, Option<&Url>) -> Result<(), ModelError>,
  {
    for kind in ModelKind::ALL {
      let now = Instant::now();
      match loader(kind, sources.get(kind)) {
        Ok(()) => info!("{} 模型加载完成，耗时: {:.2?}", kind, now.elapsed()),
        Err(e) => error!("{} 模型加载失败: {}", kind, e),
      }
    }

    let report = self.report();
    info!("模型加载结果: {:?}", report);
    report
  }

  fn load(&self, kind: ModelKind, url: Option<&Url>) -> Result<(), ModelError> {
    let url = url.ok_or_else(|| ModelError::Load(format!("未配置 {} 模型地址", kind)))?;
    info!("加载 {} 模型: {}", kind, url);
    match kind {
      ModelKind::Classifier => self
        .classifier
        .install(ClassifierBuilder::from_url(url)?.build()?),
      ModelKind::Detector => self
        .detector
        .install(DetectorBuilder::from_url(url)?.build()?),
      ModelKind::Segmenter => self
        .segmenter
        .install(SegmenterBuilder::from_url(url)?.build()?),
    }
  }
}
