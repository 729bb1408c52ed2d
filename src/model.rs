// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model.rs - 模型
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

use image::RgbImage;
use thiserror::Error;

/// 模型输入张量名
pub const INPUT_NAME: &str = "image";
/// 带标注的输出图像
pub const IMAGE_OUTPUT_NAME: &str = "image_out";
/// 已缩放到输出图像坐标系的检测框
pub const BOX_OUTPUT_NAME: &str = "scaled_box_out_next";
/// 每条检测框记录的长度
pub const BOX_RECORD_LEN: usize = 6;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;

  /// 释放模型持有的资源
  fn close(self) -> Result<(), Self::Error>
  where
    Self: Sized,
  {
    Ok(())
  }
}

/// 推理运行时的会话
///
/// 输入张量与输出句柄都由调用方持有，离开作用域时释放。
pub trait InferenceSession {
  type Tensor;
  type Outputs: ModelOutputs;

  /// 创建一维 u8 输入张量
  fn create_tensor(
    &self,
    name: &str,
    shape: &[usize],
    data: &[u8],
  ) -> Result<Self::Tensor, SessionError>;

  /// 同步执行一次推理，只取 `output_names` 指定的输出
  fn run(
    &mut self,
    input: &Self::Tensor,
    output_names: &[&str],
  ) -> Result<Self::Outputs, SessionError>;

  /// 关闭会话，释放模型相关的全部资源
  fn close(self) -> Result<(), SessionError>
  where
    Self: Sized,
  {
    Ok(())
  }
}

pub trait ModelOutputs {
  fn bytes(&self, name: &str) -> Result<&[u8], SessionError>;
  /// 返回 (形状, 数据)
  fn floats(&self, name: &str) -> Result<(&[usize], &[f32]), SessionError>;
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("推理运行时错误: {0}")]
  Runtime(String),
  #[error("模型缺少输出: {0}")]
  MissingOutput(String),
  #[error("输出 {name} 类型不匹配, 期望 {expected}")]
  OutputType { name: String, expected: &'static str },
}

#[derive(Error, Debug)]
pub enum SessionInitError {
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("自定义算子库加载失败: {path}: {reason}")]
  OperatorLibrary { path: String, reason: String },
  #[error("推理会话创建失败: {0}")]
  Runtime(String),
  #[error("模型路径错误: {0}")]
  ModelPath(String),
  #[error("模型参数错误: {0}")]
  InvalidParameter(String),
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("创建输入张量失败: {0}")]
  Tensor(#[source] SessionError),
  #[error("模型推理失败: {0}")]
  Run(#[source] SessionError),
  #[error("读取模型输出失败: {0}")]
  Output(#[source] SessionError),
  #[error("输出图像解码失败: {0}")]
  Decode(#[from] image::ImageError),
  #[error("检测框输出格式错误: 形状 {shape:?}, 长度 {len}")]
  MalformedBoxes { shape: Vec<usize>, len: usize },
  #[error("关闭推理会话失败: {0}")]
  Close(#[source] SessionError),
}

/// `[center_x, center_y, width, height, confidence, class_index]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionBox([f32; BOX_RECORD_LEN]);

impl From<[f32; BOX_RECORD_LEN]> for DetectionBox {
  fn from(record: [f32; BOX_RECORD_LEN]) -> Self {
    Self(record)
  }
}

impl TryFrom<&[f32]> for DetectionBox {
  type Error = usize;

  fn try_from(record: &[f32]) -> Result<Self, Self::Error> {
    <[f32; BOX_RECORD_LEN]>::try_from(record)
      .map(Self)
      .map_err(|_| record.len())
  }
}

impl DetectionBox {
  pub fn center_x(&self) -> f32 {
    self.0[0]
  }

  pub fn center_y(&self) -> f32 {
    self.0[1]
  }

  pub fn width(&self) -> f32 {
    self.0[2]
  }

  pub fn height(&self) -> f32 {
    self.0[3]
  }

  pub fn confidence(&self) -> f32 {
    self.0[4]
  }

  pub fn raw_class_index(&self) -> f32 {
    self.0[5]
  }

  /// 非负整数时返回类别索引
  pub fn class_index(&self) -> Option<usize> {
    let raw = self.raw_class_index();
    if raw.is_finite() && raw >= 0.0 && raw.fract() == 0.0 {
      Some(raw as usize)
    } else {
      None
    }
  }

  /// 中心点 + 宽高 转 [x_min, y_min, x_max, y_max]
  pub fn corners(&self) -> [f32; 4] {
    let (half_w, half_h) = (self.width() / 2.0, self.height() / 2.0);
    [
      self.center_x() - half_w,
      self.center_y() - half_h,
      self.center_x() + half_w,
      self.center_y() + half_h,
    ]
  }
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
  pub output_image: RgbImage,
  pub detections: Vec<DetectionBox>,
}

impl DetectionResult {
  pub fn is_empty(&self) -> bool {
    self.detections.is_empty()
  }

  pub fn len(&self) -> usize {
    self.detections.len()
  }
}

mod detector;
pub use self::detector::Detector;

#[cfg(feature = "onnxruntime")]
mod onnx;
#[cfg(feature = "onnxruntime")]
pub use self::onnx::{OnnxOutputs, OnnxSession, OnnxSessionBuilder, OnnxTensor};
