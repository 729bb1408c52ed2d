// 该文件是 Qianli （千里眼） 项目的一部分。
// src/frame.rs - 相机帧与编码帧定义
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

use thiserror::Error;
use tracing::trace;

/// Y、U、V 三个平面
pub const PLANE_COUNT: usize = 3;

#[derive(Error, Debug)]
pub enum InvalidFrameError {
  #[error("相机帧不包含图像数据")]
  NoImageData,
  #[error("相机帧尺寸为零: {width}x{height}")]
  ZeroSized { width: u32, height: u32 },
  #[error("第 {plane} 个平面数据不足: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  PlaneTooShort {
    plane: usize,
    expected: usize,
    actual: usize,
  },
  #[error("图像编解码错误: {0}")]
  Codec(#[from] image::ImageError),
}

/// 单个图像平面，步长语义与相机驱动一致
#[derive(Debug, Clone)]
pub struct Plane {
  data: Vec<u8>,
  row_stride: usize,
  pixel_stride: usize,
}

impl Plane {
  pub fn new(data: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
    Self {
      data,
      row_stride,
      pixel_stride: pixel_stride.max(1),
    }
  }

  /// 紧密排列的平面（像素步长为 1）
  pub fn packed(data: Vec<u8>, width: usize) -> Self {
    Self::new(data, width, 1)
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn row_stride(&self) -> usize {
    self.row_stride
  }

  pub fn pixel_stride(&self) -> usize {
    self.pixel_stride
  }

  /// 容纳 `width` x `height` 个采样点所需的最小字节数
  pub fn required_len(&self, width: usize, height: usize) -> usize {
    if width == 0 || height == 0 {
      return 0;
    }
    (height - 1) * self.row_stride + (width - 1) * self.pixel_stride + 1
  }

  #[inline]
  pub(crate) fn sample(&self, x: usize, y: usize) -> u8 {
    self.data[y * self.row_stride + x * self.pixel_stride]
  }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// 相机输出的平面 YUV 4:2:0 帧
///
/// 帧在 drop 时被释放（关闭），释放回调恰好执行一次。
pub struct RawFrame {
  width: u32,
  height: u32,
  index: u64,
  planes: Option<[Plane; PLANE_COUNT]>,
  on_release: Option<ReleaseHook>,
}

impl RawFrame {
  pub fn new(width: u32, height: u32, planes: [Plane; PLANE_COUNT]) -> Self {
    Self {
      width,
      height,
      index: 0,
      planes: Some(planes),
      on_release: None,
    }
  }

  /// 没有图像数据的帧
  pub fn empty(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      index: 0,
      planes: None,
      on_release: None,
    }
  }

  /// 从紧密排列的 I420（YU12）缓冲区创建帧
  pub fn from_i420(width: u32, height: u32, data: &[u8]) -> Result<Self, InvalidFrameError> {
    if width == 0 || height == 0 {
      return Err(InvalidFrameError::ZeroSized { width, height });
    }

    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = chroma_size(width, height);
    let (cw, ch) = (cw as usize, ch as usize);
    let luma = w * h;
    let chroma = cw * ch;
    let expected = luma + 2 * chroma;
    if data.len() < expected {
      return Err(InvalidFrameError::PlaneTooShort {
        plane: 0,
        expected,
        actual: data.len(),
      });
    }

    let y = Plane::packed(data[..luma].to_vec(), w);
    let u = Plane::packed(data[luma..luma + chroma].to_vec(), cw);
    let v = Plane::packed(data[luma + chroma..expected].to_vec(), cw);
    Ok(Self::new(width, height, [y, u, v]))
  }

  pub fn with_index(mut self, index: u64) -> Self {
    self.index = index;
    self
  }

  /// 设置释放回调，帧关闭时调用
  pub fn with_release<F>(mut self, hook: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    self.on_release = Some(Box::new(hook));
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn planes(&self) -> Option<&[Plane; PLANE_COUNT]> {
    self.planes.as_ref()
  }

  pub fn chroma_size(&self) -> (u32, u32) {
    chroma_size(self.width, self.height)
  }
}

impl Drop for RawFrame {
  fn drop(&mut self) {
    trace!("释放第 {} 帧", self.index);
    if let Some(hook) = self.on_release.take() {
      hook();
    }
  }
}

impl std::fmt::Debug for RawFrame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RawFrame")
      .field("width", &self.width)
      .field("height", &self.height)
      .field("index", &self.index)
      .field("has_data", &self.planes.is_some())
      .finish()
  }
}

pub(crate) fn chroma_size(width: u32, height: u32) -> (u32, u32) {
  (width.div_ceil(2), height.div_ceil(2))
}

/// 编码后的单幅图像（JPEG 字节）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
  bytes: Vec<u8>,
  width: u32,
  height: u32,
}

impl EncodedFrame {
  pub fn new(bytes: Vec<u8>, width: u32, height: u32) -> Self {
    Self {
      bytes,
      width,
      height,
    }
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }
}

impl AsRef<[u8]> for EncodedFrame {
  fn as_ref(&self) -> &[u8] {
    &self.bytes
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn release_hook_runs_once_on_drop() {
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let frame = RawFrame::empty(4, 4).with_release(move || {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(released.load(Ordering::SeqCst), 0);
    drop(frame);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn i420_buffer_is_split_into_planes() {
    // 3x3 帧，色度平面为 2x2
    let data: Vec<u8> = (0..9 + 4 + 4).collect();
    let frame = RawFrame::from_i420(3, 3, &data).unwrap();
    let [y, u, v] = frame.planes().unwrap();
    assert_eq!(y.data().len(), 9);
    assert_eq!(u.data(), &[9, 10, 11, 12]);
    assert_eq!(v.data(), &[13, 14, 15, 16]);
    assert_eq!(frame.chroma_size(), (2, 2));
  }

  #[test]
  fn short_i420_buffer_is_rejected() {
    let err = RawFrame::from_i420(4, 4, &[0u8; 10]).unwrap_err();
    assert!(matches!(
      err,
      InvalidFrameError::PlaneTooShort {
        expected: 24,
        actual: 10,
        ..
      }
    ));
  }

  #[test]
  fn required_len_accounts_for_strides() {
    let plane = Plane::new(vec![0; 64], 16, 2);
    assert_eq!(plane.required_len(4, 2), 16 + 3 * 2 + 1);
    assert_eq!(plane.required_len(0, 2), 0);
  }
}
