// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::{path::Path, sync::Arc};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  labels::ClassLabels,
  model::{DetectionBox, DetectionResult},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const LABEL_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

static DEFAULT_FONT: &[u8] = include_bytes!("../../assets/font.ttf");

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("字体文件读取错误: {0}")]
  FontIo(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

pub struct Draw {
  labels: Arc<ClassLabels>,
  font: Option<FontArc>,
  font_size: f32,
  label_text_vertical_padding: i32,
  label_color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      labels: Arc::new(ClassLabels::default()),
      font: FontArc::try_from_slice(DEFAULT_FONT)
        .inspect_err(|e| warn!("无法加载嵌入的字体: {}", e))
        .ok(),
      font_size: LABEL_FONT_SIZE,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      label_color: LABEL_COLOR,
    }
  }
}

impl Draw {
  pub fn new(labels: Arc<ClassLabels>) -> Self {
    Self {
      labels,
      ..Self::default()
    }
  }

  pub fn with_labels(mut self, labels: Arc<ClassLabels>) -> Self {
    self.labels = labels;
    self
  }

  pub fn with_font_file(mut self, path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let path = path.as_ref();
    info!("加载字体文件: {}", path.display());
    let data = std::fs::read(path)?;
    self.font = Some(FontArc::try_from_vec(data)?);
    Ok(self)
  }

  /// 在输出图像的副本上绘制全部检测框
  pub fn draw_result(&self, result: &DetectionResult) -> RgbImage {
    let mut image = result.output_image.clone();
    self.draw_detections(&mut image, &result.detections);
    image
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[DetectionBox]) {
    for detection in detections {
      let caption = match self.labels.caption(detection) {
        Ok(caption) => Some(caption),
        Err(e) => {
          warn!("跳过标签文本: {}", e);
          None
        }
      };
      self.draw_bbox_with_label(image, &detection.corners(), caption.as_deref());
    }
  }

  // bbox 为像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: &[f32; 4], caption: Option<&str>) {
    if image.width() == 0 || image.height() == 0 {
      return;
    }
    let (w, h) = (image.width() as i32, image.height() as i32);

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = Rgb(self.label_color);
    for t in 0..BOX_THICKNESS {
      let (width, height) = (x_max - x_min + 1 - 2 * t, y_max - y_min + 1 - 2 * t);
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(caption) = caption else {
      return;
    };
    let Some(font) = self.font.as_ref() else {
      debug!("未加载字体, 标签: {}", caption);
      return;
    };

    let scale = PxScale::from(self.font_size);
    let (text_width, text_height) = text_size(scale, font, caption);
    let text_height = text_height as i32 + 2 * self.label_text_vertical_padding;

    // 标签放在边框上方
    let label_x = x_min;
    let label_y = (y_min - text_height).max(0);
    let label_width = (text_width as i32).min(w - label_x);

    if label_width > 0 && text_height > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_width as u32, text_height as u32);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb(TEXT_COLOR),
        label_x,
        label_y + self.label_text_vertical_padding,
        scale,
        font,
        caption,
      );
    }
  }
}

/// 以文本形式记录检测结果，每行 `label, confidence, cx, cy, w, h`
pub struct Record {
  pub label_with_name: bool,
  pub labels: Arc<ClassLabels>,
}

impl Record {
  pub fn format(&self, detections: &[DetectionBox]) -> String {
    detections
      .iter()
      .map(|detection| {
        let name = match (self.label_with_name, detection.class_index()) {
          (true, _) => match self.labels.label_of(detection) {
            Ok(label) => label.to_string(),
            Err(e) => {
              warn!("{}", e);
              format!("{}", detection.raw_class_index())
            }
          },
          (false, Some(index)) => index.to_string(),
          (false, None) => format!("{}", detection.raw_class_index()),
        };
        format!(
          "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
          name,
          detection.confidence(),
          detection.center_x(),
          detection.center_y(),
          detection.width(),
          detection.height()
        )
      })
      .collect::<Vec<_>>()
      .join("\n")
  }

  pub fn record(&self, detections: &[DetectionBox], path: &Path) -> Result<(), std::io::Error> {
    std::fs::write(path.with_extension("txt"), self.format(detections))
  }
}
