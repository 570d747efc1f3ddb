// 该文件是 Kanjian （看见） 项目的一部分。
// src/server.rs - HTTP 服务
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

use std::sync::Arc;

use axum::{
  Json, Router,
  extract::{DefaultBodyLimit, State, rejection::JsonRejection},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::pipeline::{
  BatchRequest, BatchResponse, ClassifyResponse, DetectionResponse, ErrorResponse,
  HealthResponse, INVALID_IMAGES_MESSAGE, ImageRequest, ModelInfoResponse, NO_IMAGE_MESSAGE,
  Pipeline, PipelineError, SegmentationResponse,
};

/// 默认请求体上限 32 MiB
pub const DEFAULT_BODY_LIMIT: usize = 32 * 1024 * 1024;

type AppState = Arc<Pipeline>;

pub fn router(pipeline: Arc<Pipeline>, body_limit: usize) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/predict", post(predict))
    .route("/predict_batch", post(predict_batch))
    .route("/model_info", get(model_info))
    .route("/predict_detection", post(predict_detection))
    .route("/predict_segmentation", post(predict_segmentation))
    .layer(DefaultBodyLimit::max(body_limit))
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http())
    .with_state(pipeline)
}

/// 失败响应，状态码由错误类型决定，响应体总是 `{success: false, error}`
#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  body: ErrorResponse,
}

impl From<PipelineError> for ApiError {
  fn from(err: PipelineError) -> Self {
    let status = if err.is_client_fault() {
      StatusCode::BAD_REQUEST
    } else {
      StatusCode::INTERNAL_SERVER_ERROR
    };
    if status.is_server_error() {
      error!("请求处理失败: {}", err);
    } else {
      warn!("请求无效: {}", err);
    }
    Self {
      status,
      body: ErrorResponse::from(&err),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status, Json(self.body)).into_response()
  }
}

/// 无法解析的 JSON 请求体按校验失败处理，超出大小限制时保留 413
fn parse_body<T>(payload: Result<Json<T>, JsonRejection>, message: &str) -> Result<T, ApiError> {
  match payload {
    Ok(Json(body)) => Ok(body),
    Err(rejection) => {
      warn!("请求体无法解析: {}", rejection.body_text());
      if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return Err(ApiError {
          status: StatusCode::PAYLOAD_TOO_LARGE,
          body: ErrorResponse {
            success: false,
            error: rejection.body_text(),
          },
        });
      }
      Err(PipelineError::validation(message).into())
    }
  }
}

/// 推理是同步的，放到阻塞线程上执行
async fn run_blocking<T, F>(pipeline: AppState, job: F) -> Result<Json<T>, ApiError>
where
  T: Send + 'static,
  F: FnOnce(&Pipeline) -> Result<T, PipelineError> + Send + 'static,
{
  let outcome = tokio::task::spawn_blocking(move || job(&pipeline))
    .await
    .map_err(|e| PipelineError::Worker(e.to_string()))?;
  Ok(Json(outcome?))
}

async fn health(State(pipeline): State<AppState>) -> Json<HealthResponse> {
  Json(pipeline.health())
}

async fn predict(
  State(pipeline): State<AppState>,
  payload: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Json<ClassifyResponse>, ApiError> {
  let request = parse_body(payload, NO_IMAGE_MESSAGE)?;
  run_blocking(pipeline, move |p| p.classify(&request)).await
}

async fn predict_batch(
  State(pipeline): State<AppState>,
  payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
  let request = parse_body(payload, INVALID_IMAGES_MESSAGE)?;
  run_blocking(pipeline, move |p| p.classify_batch(&request)).await
}

async fn model_info(State(pipeline): State<AppState>) -> Result<Json<ModelInfoResponse>, ApiError> {
  Ok(Json(pipeline.model_info()?))
}

async fn predict_detection(
  State(pipeline): State<AppState>,
  payload: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Json<DetectionResponse>, ApiError> {
  let request = parse_body(payload, NO_IMAGE_MESSAGE)?;
  run_blocking(pipeline, move |p| p.detect(&request)).await
}

async fn predict_segmentation(
  State(pipeline): State<AppState>,
  payload: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Json<SegmentationResponse>, ApiError> {
  let request = parse_body(payload, NO_IMAGE_MESSAGE)?;
  run_blocking(pipeline, move |p| p.segment(&request)).await
}

/// 等待 Ctrl-C，之后停止接收新连接
pub async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到中断信号，准备退出..."),
    Err(e) => {
      error!("无法监听中断信号: {}", e);
      std::future::pending::<()>().await
    }
  }
}
