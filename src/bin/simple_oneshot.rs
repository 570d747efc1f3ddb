// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像离线推理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use kanjian::{
  FromUrl,
  input::ImageFileInput,
  model::{ClassifierBuilder, DetectorBuilder, SegmenterBuilder},
  output::SaveImageFileOutput,
  task::{OneShotTask, RepeatShotTask, Task},
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
  Classify,
  Detect,
  Segment,
}

/// 用一个模型处理一张图像，把结果写到磁盘
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型类型
  #[arg(long, value_enum)]
  kind: Kind,
  /// 模型地址，例如 onnx:///models/best.onnx
  #[arg(long, value_name = "MODEL")]
  model: Url,
  /// 输入图像，例如 image:///data/leaf.jpg
  #[arg(long, value_name = "SOURCE")]
  input: Url,
  /// 输出图像，例如 image:///data/leaf_out.jpg
  #[arg(long, value_name = "OUTPUT")]
  output: Url,
  /// 重复推理次数，大于 1 时输出平均耗时
  #[arg(long, default_value_t = 1)]
  repeat: usize,
}

fn run<M, T>(args: &Args, model: M) -> Result<()>
where
  M: kanjian::model::Model<Input = kanjian::frame::PixelGrid, Output = T>,
  M::Error: std::error::Error + Send + Sync + 'static,
  SaveImageFileOutput: kanjian::output::Render<
      kanjian::frame::PixelGrid,
      T,
      Error = kanjian::output::SaveImageFileError,
    >,
{
  let input = ImageFileInput::from_url(&args.input)?;
  let output = SaveImageFileOutput::from_url(&args.output)?;
  if args.repeat > 1 {
    RepeatShotTask::new(args.repeat).run_task(input, model, output)
  } else {
    OneShotTask.run_task(input, model, output)
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  info!("模型类型: {:?}", args.kind);
  info!("模型地址: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  match args.kind {
    Kind::Classify => run(&args, ClassifierBuilder::from_url(&args.model)?.build()?),
    Kind::Detect => run(&args, DetectorBuilder::from_url(&args.model)?.build()?),
    Kind::Segment => run(&args, SegmenterBuilder::from_url(&args.model)?.build()?),
  }
}
