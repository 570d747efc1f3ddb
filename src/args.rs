// 该文件是 Kanjian （看见） 项目的一部分。
// src/args.rs - 服务参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::net::SocketAddr;

use clap::Parser;
use url::Url;

use kanjian::{codec::DEFAULT_JPEG_QUALITY, registry::ModelSources, server::DEFAULT_BODY_LIMIT};

/// Kanjian 推理服务参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听地址
  #[arg(long, env = "KANJIAN_LISTEN", default_value = "0.0.0.0:5000")]
  pub listen: SocketAddr,

  /// 分类模型地址
  /// 例如: onnx:///models/classifier.onnx?range=byte&layout=nhwc
  #[arg(long, env = "KANJIAN_CLASSIFIER", value_name = "MODEL")]
  pub classifier: Option<Url>,

  /// 检测模型地址
  /// 例如: onnx:///models/best.onnx?labels=/models/labels.txt&confidence=0.25
  #[arg(long, env = "KANJIAN_DETECTOR", value_name = "MODEL")]
  pub detector: Option<Url>,

  /// 分割模型地址
  /// 例如: onnx:///models/unet_segmentation.onnx
  #[arg(long, env = "KANJIAN_SEGMENTER", value_name = "MODEL")]
  pub segmenter: Option<Url>,

  /// 返回图像的 JPEG 质量 (1 - 100)
  #[arg(long, env = "KANJIAN_JPEG_QUALITY", default_value_t = DEFAULT_JPEG_QUALITY)]
  pub jpeg_quality: u8,

  /// 请求体大小上限（字节）
  #[arg(long, env = "KANJIAN_BODY_LIMIT", default_value_t = DEFAULT_BODY_LIMIT)]
  pub body_limit: usize,

  /// 部分模型加载失败时仍然启动服务
  #[arg(long, env = "KANJIAN_ALLOW_PARTIAL")]
  pub allow_partial: bool,
}

impl Args {
  pub fn model_sources(&self) -> ModelSources {
    ModelSources {
      classifier: self.classifier.clone(),
      detector: self.detector.clone(),
      segmenter: self.segmenter.clone(),
    }
  }
}
