// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/draw.rs - 推理结果可视化
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

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage, imageops::FilterType};
use imageproc::drawing::draw_text_mut;

use crate::{
  frame::{ClassMask, PixelGrid},
  model::{Detection, SegmentationResult},
  output::RenderError,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
/// 边框上沿距图像顶部不超过该距离时，标签改画在框内
const LABEL_MARGIN: i32 = 10;
const LABEL_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色
const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const BOX_THICKNESS: i32 = 2;

// 掩码叠加常量
const OVERLAY_COLOR: [u8; 3] = [255, 100, 100]; // 浅红色
const OVERLAY_ALPHA_PERCENT: u16 = 40;

static FONT_DATA: &[u8] = include_bytes!("../../assets/font.ttf");

/// 在图像副本上绘制推理结果
pub trait Annotate<R> {
  fn annotate(&self, frame: &PixelGrid, result: &R) -> Result<PixelGrid, RenderError>;
}

pub struct Draw<'a> {
  font_size: f32,
  label_text_height: i32,
  label_text_vertical_padding: i32,
  font: FontRef<'a>,
  label_color: [u8; 3],
  box_color: [u8; 3],
}

impl Draw<'static> {
  /// 使用内嵌字体
  pub fn new() -> Result<Self, RenderError> {
    let font = FontRef::try_from_slice(FONT_DATA).map_err(|e| RenderError::Font(e.to_string()))?;
    Ok(Self::with_font(font))
  }
}

impl<'a> Draw<'a> {
  pub fn with_font(font: FontRef<'a>) -> Self {
    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      font,
      label_color: LABEL_COLOR,
      box_color: BOX_COLOR,
    }
  }

  /// 画出检测框与标签，输入网格保持不变
  pub fn draw_boxes(&self, grid: &PixelGrid, detections: &[Detection]) -> PixelGrid {
    let mut annotated = grid.clone();
    for detection in detections {
      self.draw_bbox_with_label(annotated.as_image_mut(), detection);
    }
    annotated
  }

  /// 将网格缩放到掩码的分辨率，再把前景像素与叠加色按 alpha 混合
  ///
  /// 背景像素保持原值，全背景掩码返回与缩放后网格完全相同的图像。
  pub fn overlay_mask(
    &self,
    grid: &PixelGrid,
    mask: &ClassMask,
    target: (u32, u32),
  ) -> Result<PixelGrid, RenderError> {
    let (width, height) = target;
    if mask.width() != width as usize || mask.height() != height as usize {
      return Err(RenderError::MaskShape {
        mask: (mask.width(), mask.height()),
        target,
      });
    }

    let mut overlay = grid.resized(width, height, FilterType::CatmullRom);
    let image = overlay.as_image_mut();
    for (x, y, pixel) in image.enumerate_pixels_mut() {
      if !mask.is_foreground(x as usize, y as usize) {
        continue;
      }
      for (channel, color) in pixel.0.iter_mut().zip(OVERLAY_COLOR) {
        *channel = blend(*channel, color);
      }
    }
    Ok(overlay)
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, detection: &Detection) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    // Clamp to image bounds
    let x_min = detection.xmin.clamp(0, w - 1);
    let y_min = detection.ymin.clamp(0, h - 1);
    let x_max = detection.xmax.clamp(0, w - 1);
    let y_max = detection.ymax.clamp(0, h - 1);

    // 绘制边框（加粗为2像素）
    for thickness in 0..BOX_THICKNESS {
      let x_min_t = (x_min + thickness).min(x_max);
      let y_min_t = (y_min + thickness).min(y_max);
      let x_max_t = (x_max - thickness).max(x_min_t);
      let y_max_t = (y_max - thickness).max(y_min_t);

      // Top and bottom edges
      for x in x_min_t..=x_max_t {
        image.put_pixel(x as u32, y_min_t as u32, Rgb(self.box_color));
        image.put_pixel(x as u32, y_max_t as u32, Rgb(self.box_color));
      }

      // Left and right edges
      for y in y_min_t..=y_max_t {
        image.put_pixel(x_min_t as u32, y as u32, Rgb(self.box_color));
        image.put_pixel(x_max_t as u32, y as u32, Rgb(self.box_color));
      }
    }

    // 绘制文本
    let (label_x, label_y) = self.label_origin(x_min, y_min);
    draw_text_mut(
      image,
      Rgb(self.label_color),
      label_x,
      label_y,
      PxScale::from(self.font_size),
      &self.font,
      &detection.label(),
    );
  }

  /// 标签左上角位置：默认在边框上方，靠近图像顶部时放到边框内侧
  fn label_origin(&self, x_min: i32, y_min: i32) -> (i32, i32) {
    if y_min - LABEL_MARGIN > LABEL_MARGIN {
      (x_min, (y_min - self.label_text_height).max(0))
    } else {
      (
        x_min + BOX_THICKNESS,
        y_min + BOX_THICKNESS + self.label_text_vertical_padding,
      )
    }
  }
}

#[inline]
fn blend(pixel: u8, color: u8) -> u8 {
  let mixed =
    (OVERLAY_ALPHA_PERCENT * color as u16 + (100 - OVERLAY_ALPHA_PERCENT) * pixel as u16) / 100;
  mixed as u8
}

impl Annotate<Vec<Detection>> for Draw<'_> {
  fn annotate(&self, frame: &PixelGrid, result: &Vec<Detection>) -> Result<PixelGrid, RenderError> {
    Ok(self.draw_boxes(frame, result))
  }
}

impl Annotate<SegmentationResult> for Draw<'_> {
  fn annotate(
    &self,
    frame: &PixelGrid,
    result: &SegmentationResult,
  ) -> Result<PixelGrid, RenderError> {
    let mask = &result.class_mask;
    self.overlay_mask(frame, mask, (mask.width() as u32, mask.height() as u32))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeSet;

  fn detection(xmin: i32, ymin: i32, xmax: i32, ymax: i32) -> Detection {
    Detection {
      xmin,
      ymin,
      xmax,
      ymax,
      confidence: 0.87,
      class_index: 0,
      class_name: "leaf".to_string(),
    }
  }

  #[test]
  fn boxes_are_drawn_on_a_copy() {
    let draw = Draw::new().unwrap();
    let grid = PixelGrid::filled(200, 200, [0, 0, 0]);
    let annotated = draw.draw_boxes(&grid, &[detection(50, 60, 150, 180)]);

    assert_eq!(grid, PixelGrid::filled(200, 200, [0, 0, 0]));
    assert_eq!(annotated.shape(), grid.shape());
    assert_eq!(annotated.pixel(50, 120), BOX_COLOR);
    assert_eq!(annotated.pixel(51, 120), BOX_COLOR);
    assert_eq!(annotated.pixel(150, 120), BOX_COLOR);
    assert_eq!(annotated.pixel(100, 180), BOX_COLOR);
    assert_eq!(annotated.pixel(100, 120), [0, 0, 0]);
  }

  #[test]
  fn label_is_rendered_above_the_box() {
    let draw = Draw::new().unwrap();
    let grid = PixelGrid::filled(300, 200, [0, 0, 0]);
    let annotated = draw.draw_boxes(&grid, &[detection(20, 100, 280, 190)]);

    let text_pixels = (20..280)
      .flat_map(|x| (76..100).map(move |y| (x, y)))
      .filter(|&(x, y)| annotated.pixel(x, y) != [0, 0, 0])
      .count();
    assert!(text_pixels > 0);
  }

  #[test]
  fn label_moves_inside_near_the_top() {
    let draw = Draw::new().unwrap();
    assert_eq!(draw.label_origin(30, 100), (30, 100 - LABEL_TEXT_HEIGHT));
    assert_eq!(draw.label_origin(30, 20), (32, 24));
    assert_eq!(draw.label_origin(0, 0), (2, 4));
  }

  #[test]
  fn no_detections_leaves_pixels_untouched() {
    let draw = Draw::new().unwrap();
    let grid = PixelGrid::filled(64, 32, [12, 34, 56]);
    assert_eq!(draw.annotate(&grid, &Vec::new()).unwrap(), grid);
  }

  #[test]
  fn out_of_range_boxes_do_not_panic() {
    let draw = Draw::new().unwrap();
    let grid = PixelGrid::filled(10, 10, [0, 0, 0]);
    let annotated = draw.draw_boxes(&grid, &[detection(-20, -5, 400, 300), detection(9, 9, 9, 9)]);
    assert_eq!(annotated.pixel(0, 5), BOX_COLOR);
  }

  #[test]
  fn background_mask_is_identity() {
    let draw = Draw::new().unwrap();
    let mut grid = PixelGrid::filled(16, 16, [0, 0, 0]);
    for (x, y, pixel) in grid.as_image_mut().enumerate_pixels_mut() {
      *pixel = Rgb([(x * 16) as u8, (y * 16) as u8, 7]);
    }
    let overlay = draw.overlay_mask(&grid, &ClassMask::new(16, 16), (16, 16)).unwrap();
    assert_eq!(overlay, grid);
  }

  #[test]
  fn foreground_pixels_are_blended() {
    let draw = Draw::new().unwrap();
    let grid = PixelGrid::filled(4, 4, [100, 50, 0]);
    let mut mask = ClassMask::new(4, 4);
    mask.set(1, 2, 1);

    let overlay = draw.overlay_mask(&grid, &mask, (4, 4)).unwrap();
    assert_eq!(overlay.pixel(1, 2), [162, 70, 40]);
    assert_eq!(overlay.pixel(0, 0), [100, 50, 0]);
  }

  #[test]
  fn grid_is_resized_to_mask_resolution() {
    let draw = Draw::new().unwrap();
    let grid = PixelGrid::filled(640, 480, [9, 9, 9]);
    let result = SegmentationResult {
      class_mask: ClassMask::new(256, 256),
      presence_flags: BTreeSet::from([0]),
    };
    let overlay = draw.annotate(&grid, &result).unwrap();
    assert_eq!(overlay.shape(), (256, 256, 3));
    assert_eq!(overlay.pixel(100, 100), [9, 9, 9]);
  }

  #[test]
  fn mismatched_mask_is_rejected() {
    let draw = Draw::new().unwrap();
    let grid = PixelGrid::filled(8, 8, [0, 0, 0]);
    let err = draw.overlay_mask(&grid, &ClassMask::new(4, 4), (8, 8)).unwrap_err();
    assert!(matches!(err, RenderError::MaskShape { .. }));
  }
}
