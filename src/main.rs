// 该文件是 Kanjian （看见） 项目的一部分。
// src/main.rs - 推理服务主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kanjian::{
  codec::Codec,
  pipeline::Pipeline,
  registry::ModelRegistry,
  server::{router, shutdown_signal},
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();

  info!("Kanjian 视觉推理服务");
  info!("监听地址: {}", args.listen);
  info!("JPEG 质量: {}", args.jpeg_quality);
  info!("请求体上限: {} 字节", args.body_limit);

  // 模型加载完成之前不监听端口
  let registry = Arc::new(ModelRegistry::default());
  let sources = args.model_sources();
  let report = tokio::task::spawn_blocking({
    let registry = registry.clone();
    move || registry.load_all(&sources)
  })
  .await?;

  if !registry.all_ready() {
    let missing: Vec<_> = report
      .iter()
      .filter(|(_, ready)| !**ready)
      .map(|(name, _)| *name)
      .collect();
    if !args.allow_partial {
      bail!("模型加载失败: {:?}", missing);
    }
    warn!("以下模型未加载，相关接口将返回错误: {:?}", missing);
  }

  let pipeline = Arc::new(Pipeline::new(registry, Codec::with_quality(args.jpeg_quality))?);
  let app = router(pipeline, args.body_limit);

  let listener = tokio::net::TcpListener::bind(args.listen).await?;
  info!("服务已启动: http://{}", listener.local_addr()?);
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("服务已退出");
  Ok(())
}
