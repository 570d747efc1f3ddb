// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/detector.rs - YOLOv8 目标检测器
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

use std::{path::PathBuf, sync::Arc};

use image::imageops::{self, FilterType};
use ndarray::{ArrayD, ArrayView2, Axis, Ix2};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl,
  frame::{Normalization, PixelGrid, TensorLayout},
  model::{
    Backend, Detection, LabelTable, Model, ModelError, ModelSource, parse_ultralytics_names,
  },
};

pub const DETECTOR_INPUT_SIZE: u32 = 640;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.7;

/// 每个候选框的前 4 个值: cx, cy, w, h
const BOX_VALUES: usize = 4;

/// 信箱填充色，与 Ultralytics 训练时一致
const LETTERBOX_FILL: [u8; 3] = [114, 114, 114];

/// 等比缩放与居中填充的参数，用于把模型坐标映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
  scale: f32,
  pad_x: f32,
  pad_y: f32,
}

impl Letterbox {
  fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
    ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
  }
}

/// 模型输入坐标系下的候选框
#[derive(Debug, Clone)]
struct DetectItem {
  class_id: usize,
  score: f32,
  bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

/// YOLOv8 目标检测器
///
/// 低于置信度阈值的候选框以及 NMS 去重都在这里完成，输出坐标映射回原图分辨率。
pub struct Detector {
  /// 推理后端
  backend: Arc<dyn Backend>,
  /// 类别名称表
  labels: LabelTable,
  /// 模型输入边长
  input_size: u32,
  /// 置信度阈值
  confidence_threshold: f32,
  /// NMS IOU 阈值
  nms_threshold: f32,
}

impl std::fmt::Debug for Detector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Detector")
      .field("labels", &self.labels.len())
      .field("input_size", &self.input_size)
      .field("confidence_threshold", &self.confidence_threshold)
      .field("nms_threshold", &self.nms_threshold)
      .finish()
  }
}

impl Detector {
  pub fn new(backend: Arc<dyn Backend>, labels: LabelTable) -> Self {
    Self {
      backend,
      labels,
      input_size: DETECTOR_INPUT_SIZE,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
    }
  }

  pub fn with_input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn with_nms_threshold(mut self, threshold: f32) -> Self {
    self.nms_threshold = threshold;
    self
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  /// 预处理图像：保持宽高比缩放，居中贴到灰色方形画布上
  fn preprocess(&self, grid: &PixelGrid) -> (ArrayD<f32>, Letterbox) {
    let size = self.input_size.max(1);
    let width = grid.width().max(1) as f32;
    let height = grid.height().max(1) as f32;
    let scale = (size as f32 / width).min(size as f32 / height);

    let new_width = ((width * scale).round() as u32).clamp(1, size);
    let new_height = ((height * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_width) / 2;
    let pad_y = (size - new_height) / 2;

    let resized = grid.resized(new_width, new_height, FilterType::Triangle);
    let mut canvas = PixelGrid::filled(size, size, LETTERBOX_FILL);
    imageops::replace(
      canvas.as_image_mut(),
      resized.as_image(),
      pad_x as i64,
      pad_y as i64,
    );

    let tensor = canvas
      .to_tensor(TensorLayout::Nchw, Normalization::Unit)
      .into_dyn();
    let letterbox = Letterbox {
      scale,
      pad_x: pad_x as f32,
      pad_y: pad_y as f32,
    };
    (tensor, letterbox)
  }

  /// 把输出整理为 [候选框, 4 + 类别数]
  fn candidates<'a>(&self, output: &'a ArrayD<f32>) -> Result<ArrayView2<'a, f32>, ModelError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 {
      return Err(ModelError::inference(format!(
        "期望检测输出形状为 [1, 4 + 类别数, 候选数]，实际为 {:?}",
        shape
      )));
    }

    let view = output
      .index_axis(Axis(0), 0)
      .into_dimensionality::<Ix2>()
      .map_err(|e| ModelError::inference(e.to_string()))?;

    let expected = self.labels.len() + BOX_VALUES;
    let features_first = if !self.labels.is_empty() && shape[1] == expected {
      true
    } else if !self.labels.is_empty() && shape[2] == expected {
      false
    } else {
      // 没有标签表时，较短的一维是特征维
      shape[1] <= shape[2]
    };

    let view = if features_first { view.reversed_axes() } else { view };
    if view.ncols() <= BOX_VALUES {
      return Err(ModelError::inference(format!(
        "检测输出缺少类别分数: {:?}",
        shape
      )));
    }
    debug!(
      "检测输出: {} 个候选框, {} 个类别",
      view.nrows(),
      view.ncols() - BOX_VALUES
    );
    Ok(view)
  }

  /// 后处理输出
  fn postprocess(
    &self,
    output: &ArrayD<f32>,
    letterbox: Letterbox,
    original_width: f32,
    original_height: f32,
  ) -> Result<Vec<Detection>, ModelError> {
    let rows = self.candidates(output)?;
    let mut items = Vec::new();

    for row in rows.outer_iter() {
      // 找到最高类别分数
      let (class_id, score) = row
        .iter()
        .skip(BOX_VALUES)
        .copied()
        .enumerate()
        .fold((0usize, f32::MIN), |(best_id, best), (id, s)| {
          if s > best { (id, s) } else { (best_id, best) }
        });

      if !(score >= self.confidence_threshold) {
        continue;
      }

      let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
      items.push(DetectItem {
        class_id,
        score,
        bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
      });
    }
    debug!("阈值过滤后剩余 {} 个候选框", items.len());

    // 应用 NMS
    let items = self.nms(items);

    // 去掉填充并缩放回原始图像尺寸
    let max_x = (original_width - 1.0).max(0.0);
    let max_y = (original_height - 1.0).max(0.0);

    let detections = items
      .into_iter()
      .map(|item| {
        let [x0, y0, x1, y1] = item.bbox;
        let (x0, y0) = letterbox.unmap(x0, y0);
        let (x1, y1) = letterbox.unmap(x1, y1);
        let x0 = x0.clamp(0.0, max_x) as i32;
        let y0 = y0.clamp(0.0, max_y) as i32;
        let x1 = x1.clamp(0.0, max_x) as i32;
        let y1 = y1.clamp(0.0, max_y) as i32;
        Detection {
          xmin: x0.min(x1),
          ymin: y0.min(y1),
          xmax: x0.max(x1),
          ymax: y0.max(y1),
          confidence: item.score,
          class_index: item.class_id,
          class_name: self.labels.name(item.class_id),
        }
      })
      .collect();

    Ok(detections)
  }

  /// 非极大值抑制
  fn nms(&self, mut items: Vec<DetectItem>) -> Vec<DetectItem> {
    // 按置信度降序排序
    items.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut result: Vec<DetectItem> = Vec::new();
    for item in items {
      let suppressed = result
        .iter()
        .any(|kept| kept.class_id == item.class_id && iou(kept, &item) >= self.nms_threshold);
      if !suppressed {
        result.push(item);
      }
    }

    result
  }
}

/// 计算两个边界框的 IoU
fn iou(a: &DetectItem, b: &DetectItem) -> f32 {
  let x1 = a.bbox[0].max(b.bbox[0]);
  let y1 = a.bbox[1].max(b.bbox[1]);
  let x2 = a.bbox[2].min(b.bbox[2]);
  let y2 = a.bbox[3].min(b.bbox[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a.bbox[2] - a.bbox[0]) * (a.bbox[3] - a.bbox[1]);
  let area_b = (b.bbox[2] - b.bbox[0]) * (b.bbox[3] - b.bbox[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

impl Model for Detector {
  type Input = PixelGrid;
  type Output = Vec<Detection>;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let original_width = input.width() as f32;
    let original_height = input.height() as f32;

    // 预处理
    let (tensor, letterbox) = self.preprocess(input);

    // 运行推理
    debug!("执行检测推理");
    let output = self.backend.forward(tensor)?;

    // 后处理
    let detections = self.postprocess(&output, letterbox, original_width, original_height)?;
    debug!("检测到 {} 个物体", detections.len());

    Ok(detections)
  }
}

/// 由 `onnx:///path/yolov8s.onnx?labels=/path/labels.txt&confidence=0.25&iou=0.7&size=640` 构建检测器
pub struct DetectorBuilder {
  source: ModelSource,
  labels: Option<PathBuf>,
  confidence: Option<f32>,
  iou: Option<f32>,
  size: Option<u32>,
}

impl FromUrl for DetectorBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let source = ModelSource::from_url(url)?;
    Ok(DetectorBuilder {
      labels: source.raw_option("labels").map(PathBuf::from),
      confidence: source.option("confidence")?,
      iou: source.option("iou")?,
      size: source.option("size")?,
      source,
    })
  }
}

impl DetectorBuilder {
  pub fn build(self) -> Result<Detector, ModelError> {
    info!("加载检测模型: {}", self.source.path().display());
    let backend = self.source.load_backend()?;
    let labels = resolve_labels(self.labels.as_deref(), backend.as_ref())?;
    info!("检测类别数: {}", labels.len());

    let mut detector = Detector::new(backend, labels);
    if let Some(confidence) = self.confidence {
      detector = detector.with_confidence_threshold(confidence);
    }
    if let Some(iou) = self.iou {
      detector = detector.with_nms_threshold(iou);
    }
    if let Some(size) = self.size {
      detector = detector.with_input_size(size);
    }
    info!("检测模型加载完成: {:?}", detector);
    Ok(detector)
  }
}

/// 标签文件优先，其次是模型元数据中的 `names`
fn resolve_labels(
  path: Option<&std::path::Path>,
  backend: &dyn Backend,
) -> Result<LabelTable, ModelError> {
  if let Some(path) = path {
    return LabelTable::from_file(path)
      .map_err(|e| ModelError::Load(format!("标签文件 {}: {}", path.display(), e)));
  }
  match backend.metadata("names").as_deref().map(parse_ultralytics_names) {
    Some(Some(labels)) => Ok(labels),
    Some(None) => {
      warn!("模型元数据中的 names 无法解析，使用类别编号作为名称");
      Ok(LabelTable::default())
    }
    None => {
      warn!("未找到类别标签表，使用类别编号作为名称");
      Ok(LabelTable::default())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BackendError;
  use ndarray::{Array3, IxDyn};
  use std::sync::Mutex;

  /// 在 [1, 4 + classes, anchors] 输出中写入候选框
  fn yolo_output(classes: usize, anchors: usize, boxes: &[([f32; 4], usize, f32)]) -> ArrayD<f32> {
    let mut out = Array3::<f32>::zeros((1, BOX_VALUES + classes, anchors));
    for (anchor, (cxcywh, class, score)) in boxes.iter().enumerate() {
      for (i, v) in cxcywh.iter().enumerate() {
        out[[0, i, anchor]] = *v;
      }
      out[[0, BOX_VALUES + class, anchor]] = *score;
    }
    out.into_dyn()
  }

  fn detector_with(output: ArrayD<f32>, labels: &[&str]) -> Detector {
    let backend = Arc::new(move |input: ArrayD<f32>| -> Result<ArrayD<f32>, BackendError> {
      assert_eq!(input.shape(), &[1, 3, 640, 640]);
      Ok(output.clone())
    });
    Detector::new(
      backend,
      LabelTable::from(labels.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
    )
  }

  #[test]
  fn keeps_confident_boxes_at_native_resolution() {
    let output = yolo_output(
      2,
      16,
      &[
        ([320.0, 320.0, 128.0, 64.0], 1, 0.9),
        ([100.0, 100.0, 20.0, 20.0], 0, 0.1),
      ],
    );
    let detector = detector_with(output, &["healthy", "rot"]);
    let detections = detector.infer(&PixelGrid::filled(1280, 320, [0, 0, 0])).unwrap();

    assert_eq!(detections.len(), 1);
    let det = &detections[0];
    assert_eq!(det.class_name, "rot");
    assert_eq!(det.class_index, 1);
    assert!((det.confidence - 0.9).abs() < 1e-6);
    // 缩放 0.5，上下各填充 240: x (256..384) / 0.5, y (288..352 - 240) / 0.5
    assert_eq!((det.xmin, det.xmax), (512, 768));
    assert_eq!((det.ymin, det.ymax), (96, 224));
  }

  #[test]
  fn wide_image_is_letterboxed_without_distortion() {
    // 1280x320 黑底，中间 320x320 的白色方块
    let mut grid = PixelGrid::filled(1280, 320, [0, 0, 0]);
    for (x, _, pixel) in grid.as_image_mut().enumerate_pixels_mut() {
      if (480..800).contains(&x) {
        pixel.0 = [255, 255, 255];
      }
    }

    let seen = Arc::new(Mutex::new(None));
    let captured = seen.clone();
    let output = yolo_output(1, 8, &[([320.0, 320.0, 160.0, 160.0], 0, 0.8)]);
    let backend = Arc::new(move |input: ArrayD<f32>| -> Result<ArrayD<f32>, BackendError> {
      *captured.lock().unwrap() = Some(input);
      Ok(output.clone())
    });
    let detector = Detector::new(backend, LabelTable::from(vec!["leaf".to_string()]));
    let detections = detector.infer(&grid).unwrap();

    let tensor = seen.lock().unwrap().take().unwrap();
    assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
    let fill = 114.0 / 255.0;
    assert!((tensor[[0, 0, 0, 320]] - fill).abs() < 1e-6);
    assert!((tensor[[0, 2, 639, 320]] - fill).abs() < 1e-6);
    assert!((tensor[[0, 1, 239, 320]] - fill).abs() < 1e-6);
    assert!(tensor[[0, 0, 320, 100]] < 1e-6);
    assert!(tensor[[0, 0, 320, 320]] > 0.99);

    // 方块在模型输入中仍然是正方形
    let white_cols = (0..640).filter(|&x| tensor[[0, 0, 320, x]] > 0.5).count();
    let white_rows = (0..640).filter(|&y| tensor[[0, 0, y, 320]] > 0.5).count();
    assert!((158..=162).contains(&white_cols), "{white_cols}");
    assert!((158..=162).contains(&white_rows), "{white_rows}");

    // 模型坐标 x 240..400, y 240..400 映射回原图
    assert_eq!(detections.len(), 1);
    let det = &detections[0];
    assert_eq!((det.xmin, det.xmax), (480, 800));
    assert_eq!((det.ymin, det.ymax), (0, 319));
  }

  #[test]
  fn tall_image_is_padded_left_and_right() {
    let output = yolo_output(1, 4, &[([320.0, 320.0, 64.0, 64.0], 0, 0.9)]);
    let detector = detector_with(output, &["leaf"]);
    let detections = detector.infer(&PixelGrid::filled(80, 160, [0, 0, 0])).unwrap();

    // 缩放 4，左右各填充 160: x (288..352 - 160) / 4, y 288..352 / 4
    let det = &detections[0];
    assert_eq!((det.xmin, det.xmax), (32, 48));
    assert_eq!((det.ymin, det.ymax), (72, 88));
  }

  #[test]
  fn overlapping_boxes_of_same_class_are_suppressed() {
    let output = yolo_output(
      2,
      8,
      &[
        ([100.0, 100.0, 50.0, 50.0], 0, 0.8),
        ([102.0, 101.0, 50.0, 50.0], 0, 0.95),
        ([101.0, 100.0, 50.0, 50.0], 1, 0.6),
      ],
    );
    let detector = detector_with(output, &["a", "b"]);
    let detections = detector.infer(&PixelGrid::filled(640, 640, [9, 9, 9])).unwrap();

    assert_eq!(detections.len(), 2);
    assert!((detections[0].confidence - 0.95).abs() < 1e-6);
    assert_eq!(detections[1].class_name, "b");
  }

  #[test]
  fn boxes_are_clamped_inside_the_grid() {
    let output = yolo_output(1, 8, &[([0.0, 640.0, 100.0, 100.0], 0, 0.5)]);
    let detector = detector_with(output, &["x"]);
    let detections = detector.infer(&PixelGrid::filled(64, 64, [0, 0, 0])).unwrap();

    let det = &detections[0];
    assert!(det.xmin >= 0 && det.ymin >= 0);
    assert!(det.xmax <= 63 && det.ymax <= 63);
    assert!(det.xmin <= det.xmax && det.ymin <= det.ymax);
  }

  #[test]
  fn empty_when_nothing_passes_threshold() {
    let output = yolo_output(3, 8, &[([10.0, 10.0, 5.0, 5.0], 2, 0.2)]);
    let detector = detector_with(output, &["a", "b", "c"]);
    assert!(detector.infer(&PixelGrid::filled(100, 100, [0, 0, 0])).unwrap().is_empty());
  }

  #[test]
  fn threshold_is_configurable() {
    let output = yolo_output(3, 8, &[([10.0, 10.0, 5.0, 5.0], 2, 0.2)]);
    let detector = detector_with(output, &["a", "b", "c"]).with_confidence_threshold(0.1);
    assert_eq!(detector.infer(&PixelGrid::filled(100, 100, [0, 0, 0])).unwrap().len(), 1);
  }

  #[test]
  fn accepts_transposed_output() {
    let output = yolo_output(2, 8, &[([320.0, 320.0, 64.0, 64.0], 0, 0.7)]);
    let transposed = output.permuted_axes(IxDyn(&[0, 2, 1])).as_standard_layout().to_owned();
    let detector = detector_with(transposed, &["a", "b"]);
    let detections = detector.infer(&PixelGrid::filled(640, 640, [0, 0, 0])).unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!((detections[0].xmin, detections[0].xmax), (288, 352));
  }

  #[test]
  fn unknown_class_gets_numbered_name() {
    let output = yolo_output(3, 8, &[([50.0, 50.0, 10.0, 10.0], 2, 0.9)]);
    let detector = detector_with(output, &[]);
    let detections = detector.infer(&PixelGrid::filled(640, 640, [0, 0, 0])).unwrap();
    assert_eq!(detections[0].class_name, "class_2");
  }

  #[test]
  fn rejects_unexpected_rank() {
    let detector = detector_with(ArrayD::zeros(IxDyn(&[1, 84])), &[]);
    let err = detector.infer(&PixelGrid::filled(8, 8, [0, 0, 0])).unwrap_err();
    assert!(matches!(err, ModelError::Inference(_)));
  }

  #[test]
  fn labels_fall_back_to_metadata() {
    struct WithNames;
    impl Backend for WithNames {
      fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>, BackendError> {
        Ok(input)
      }
      fn metadata(&self, key: &str) -> Option<String> {
        (key == "names").then(|| "{0: 'leaf', 1: 'fruit'}".to_string())
      }
    }
    let labels = resolve_labels(None, &WithNames).unwrap();
    assert_eq!(labels.name(1), "fruit");

    let missing = resolve_labels(Some(std::path::Path::new("/no/such/labels.txt")), &WithNames);
    assert!(matches!(missing, Err(ModelError::Load(_))));
  }
}
