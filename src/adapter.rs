// 该文件是 Qianli （千里眼） 项目的一部分。
// src/adapter.rs - 相机帧到模型输入的转换
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

//! 帧适配器：平面 YUV 帧 → NV21 → JPEG，并缩放到模型固定的输入分辨率。
//!
//! NV21 缓冲区布局为完整的亮度平面，随后是按 V、U 交错排列的色度采样。

use image::{ImageBuffer, Rgb, RgbImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use tracing::debug;

use crate::frame::{EncodedFrame, InvalidFrameError, Plane, RawFrame};

pub const DEFAULT_INPUT_WIDTH: u32 = 640;
pub const DEFAULT_INPUT_HEIGHT: u32 = 640;
pub const DEFAULT_JPEG_QUALITY: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAdapter {
  width: u32,
  height: u32,
  quality: u8,
}

impl Default for FrameAdapter {
  fn default() -> Self {
    Self {
      width: DEFAULT_INPUT_WIDTH,
      height: DEFAULT_INPUT_HEIGHT,
      quality: DEFAULT_JPEG_QUALITY,
    }
  }
}

impl FrameAdapter {
  pub fn with_target(mut self, width: u32, height: u32) -> Self {
    self.width = width;
    self.height = height;
    self
  }

  pub fn with_quality(mut self, quality: u8) -> Self {
    self.quality = quality.clamp(1, 100);
    self
  }

  pub fn target(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  /// 将相机帧转换为模型可接受的编码图像
  pub fn adapt(&self, frame: &RawFrame) -> Result<EncodedFrame, InvalidFrameError> {
    let encoded = encode_jpeg(frame, self.quality)?;
    debug!(
      "第 {} 帧编码完成: {}x{}, {} 字节",
      frame.index(),
      encoded.width(),
      encoded.height(),
      encoded.len()
    );
    self.fit(encoded)
  }

  /// 分辨率与模型输入不一致时缩放并重新编码，一致时原样返回
  pub fn fit(&self, encoded: EncodedFrame) -> Result<EncodedFrame, InvalidFrameError> {
    if encoded.dimensions() == self.target() {
      return Ok(encoded);
    }

    let (src_w, src_h) = encoded.dimensions();
    let image = image::load_from_memory(encoded.as_ref())?.to_rgb8();
    let resized = image::imageops::resize(&image, self.width, self.height, FilterType::Triangle);
    let bytes = encode_rgb(&resized, self.quality)?;
    debug!(
      "图像从 {}x{} 缩放到 {}x{}, {} 字节",
      src_w,
      src_h,
      self.width,
      self.height,
      bytes.len()
    );
    Ok(EncodedFrame::new(bytes, self.width, self.height))
  }
}

fn check_plane(
  index: usize,
  plane: &Plane,
  width: usize,
  height: usize,
) -> Result<(), InvalidFrameError> {
  let expected = plane.required_len(width, height);
  if plane.data().len() < expected {
    return Err(InvalidFrameError::PlaneTooShort {
      plane: index,
      expected,
      actual: plane.data().len(),
    });
  }
  Ok(())
}

/// 按 NV21 布局拼接亮度与色度：Y 平面之后是 V、U 交错的色度采样
pub fn to_nv21(frame: &RawFrame) -> Result<Vec<u8>, InvalidFrameError> {
  let [y_plane, u_plane, v_plane] = frame.planes().ok_or(InvalidFrameError::NoImageData)?;
  let (width, height) = (frame.width(), frame.height());
  if width == 0 || height == 0 {
    return Err(InvalidFrameError::ZeroSized { width, height });
  }

  let (w, h) = (width as usize, height as usize);
  let (cw, ch) = frame.chroma_size();
  let (cw, ch) = (cw as usize, ch as usize);

  check_plane(0, y_plane, w, h)?;
  check_plane(1, u_plane, cw, ch)?;
  check_plane(2, v_plane, cw, ch)?;

  let mut nv21 = Vec::with_capacity(w * h + 2 * cw * ch);

  for row in 0..h {
    if y_plane.pixel_stride() == 1 {
      let start = row * y_plane.row_stride();
      nv21.extend_from_slice(&y_plane.data()[start..start + w]);
    } else {
      nv21.extend((0..w).map(|x| y_plane.sample(x, row)));
    }
  }

  for row in 0..ch {
    for x in 0..cw {
      nv21.push(v_plane.sample(x, row));
      nv21.push(u_plane.sample(x, row));
    }
  }

  Ok(nv21)
}

#[inline]
fn clamp_u8(value: f32) -> u8 {
  value.round().clamp(0.0, 255.0) as u8
}

/// NV21 转 RGB（JFIF 全范围 BT.601）
pub fn nv21_to_rgb(nv21: &[u8], width: u32, height: u32) -> Result<RgbImage, InvalidFrameError> {
  let w = width as usize;
  let cw = width.div_ceil(2) as usize;
  let ch = height.div_ceil(2) as usize;
  let luma_len = w * height as usize;
  let expected = luma_len + 2 * cw * ch;
  if nv21.len() < expected {
    return Err(InvalidFrameError::PlaneTooShort {
      plane: 0,
      expected,
      actual: nv21.len(),
    });
  }

  Ok(ImageBuffer::from_fn(width, height, |x, y| {
    let (x, y) = (x as usize, y as usize);
    let luma = nv21[y * w + x] as f32;
    let chroma = luma_len + (y / 2) * cw * 2 + (x / 2) * 2;
    let v = nv21[chroma] as f32 - 128.0;
    let u = nv21[chroma + 1] as f32 - 128.0;

    let r = luma + 1.402 * v;
    let g = luma - 0.344_136 * u - 0.714_136 * v;
    let b = luma + 1.772 * u;
    Rgb([clamp_u8(r), clamp_u8(g), clamp_u8(b)])
  }))
}

fn encode_rgb(image: &RgbImage, quality: u8) -> Result<Vec<u8>, InvalidFrameError> {
  let mut bytes = Vec::new();
  {
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder.encode_image(image)?;
  }
  Ok(bytes)
}

/// 直接把相机帧编码为 JPEG，不做缩放
pub fn encode_jpeg(frame: &RawFrame, quality: u8) -> Result<EncodedFrame, InvalidFrameError> {
  let nv21 = to_nv21(frame)?;
  let rgb = nv21_to_rgb(&nv21, frame.width(), frame.height())?;
  let bytes = encode_rgb(&rgb, quality)?;
  Ok(EncodedFrame::new(bytes, frame.width(), frame.height()))
}

/// RGB 图像转平面 I420 帧，色度取 2x2 块均值
pub fn rgb_to_raw_frame(image: &RgbImage) -> RawFrame {
  let (width, height) = image.dimensions();
  let (w, h) = (width as usize, height as usize);
  let (cw, ch) = (width.div_ceil(2) as usize, height.div_ceil(2) as usize);

  let mut y_data = Vec::with_capacity(w * h);
  for Rgb([r, g, b]) in image.pixels() {
    let (r, g, b) = (*r as f32, *g as f32, *b as f32);
    y_data.push(clamp_u8(0.299 * r + 0.587 * g + 0.114 * b));
  }

  let mut u_data = Vec::with_capacity(cw * ch);
  let mut v_data = Vec::with_capacity(cw * ch);
  for cy in 0..ch {
    for cx in 0..cw {
      let (mut r, mut g, mut b, mut n) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
      for dy in 0..2 {
        for dx in 0..2 {
          let (x, y) = (cx * 2 + dx, cy * 2 + dy);
          if x < w && y < h {
            let Rgb([pr, pg, pb]) = *image.get_pixel(x as u32, y as u32);
            r += pr as f32;
            g += pg as f32;
            b += pb as f32;
            n += 1.0;
          }
        }
      }
      let (r, g, b) = (r / n, g / n, b / n);
      u_data.push(clamp_u8(-0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0));
      v_data.push(clamp_u8(0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0));
    }
  }

  RawFrame::new(
    width,
    height,
    [
      Plane::packed(y_data, w),
      Plane::packed(u_data, cw),
      Plane::packed(v_data, cw),
    ],
  )
}
