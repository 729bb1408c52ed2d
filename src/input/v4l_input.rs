// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/v4l_input.rs - V4L 相机输入
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

use std::io::ErrorKind;

use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;
use v4l::{
  Device, Format, FourCC,
  buffer::Type,
  io::{mmap::Stream as MmapStream, traits::CaptureStream},
  video::Capture,
};

use crate::{
  FromUrl, FromUrlWithScheme,
  adapter::{DEFAULT_INPUT_HEIGHT, DEFAULT_INPUT_WIDTH},
  frame::{InvalidFrameError, Plane, RawFrame, chroma_size},
  url_file_path, url_query,
};

const YU12: &[u8; 4] = b"YU12";
const DEFAULT_DEVICE: &str = "/dev/video0";
const BUFFER_COUNT: u32 = 4;

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("没有访问 {0} 的权限")]
  PermissionDenied(String),
  #[error("V4L 错误: {0}")]
  V4lError(#[from] std::io::Error),
  #[error("相机不支持 YU12 格式, 实际格式 {0}")]
  UnsupportedPixelFormat(String),
  #[error("参数错误: {0}")]
  InvalidParameter(String),
}

/// `v4l:///dev/video0?width=1280&height=720`
pub struct V4lInput {
  device_path: String,
  device: Device,
  width: u32,
  height: u32,
  stride: u32,
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = "v4l";
}

fn parse_size(url: &Url, key: &str, default: u32) -> Result<u32, V4lInputError> {
  match url_query(url, key) {
    Some(v) => v
      .parse::<u32>()
      .map_err(|_| V4lInputError::InvalidParameter(format!("{}={}", key, v))),
    None => Ok(default),
  }
}

impl FromUrl for V4lInput {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    let device_path = match url_file_path(url) {
      path if path.is_empty() || path == "/" => DEFAULT_DEVICE.to_string(),
      path => path,
    };
    let width = parse_size(url, "width", DEFAULT_INPUT_WIDTH)?;
    let height = parse_size(url, "height", DEFAULT_INPUT_HEIGHT)?;

    V4lInput::open(device_path, width, height)
  }
}

// 权限错误单独区分
fn open_error(device_path: &str, e: std::io::Error) -> V4lInputError {
  match e.kind() {
    ErrorKind::PermissionDenied => {
      error!("没有访问 {} 的权限", device_path);
      V4lInputError::PermissionDenied(device_path.to_string())
    }
    _ => V4lInputError::V4lError(e),
  }
}

impl V4lInput {
  pub fn open(device_path: String, width: u32, height: u32) -> Result<Self, V4lInputError> {
    info!("打开相机: {}", device_path);
    let device = Device::with_path(&device_path).map_err(|e| open_error(&device_path, e))?;

    let format = Capture::set_format(&device, &Format::new(width, height, FourCC::new(YU12)))?;
    if format.fourcc != FourCC::new(YU12) {
      return Err(V4lInputError::UnsupportedPixelFormat(format.fourcc.to_string()));
    }
    if (format.width, format.height) != (width, height) {
      warn!(
        "相机不支持 {}x{}, 实际分辨率 {}x{}",
        width, height, format.width, format.height
      );
    }
    info!(
      "相机格式: {} {}x{}, 行步长 {}",
      format.fourcc, format.width, format.height, format.stride
    );

    Ok(Self {
      device_path,
      device,
      width: format.width,
      height: format.height,
      stride: format.stride.max(format.width),
    })
  }

  pub fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  pub fn into_frames(self) -> Result<V4lInputFrames, V4lInputError> {
    let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT)?;
    info!("开始采集: {}", self.device_path);
    Ok(V4lInputFrames {
      stream,
      width: self.width,
      height: self.height,
      stride: self.stride,
      next_index: 0,
      _device: self.device,
    })
  }
}

pub struct V4lInputFrames {
  stream: MmapStream<'static>,
  width: u32,
  height: u32,
  stride: u32,
  next_index: u64,
  _device: Device,
}

/// 按行步长切分 YU12 缓冲区，色度平面步长为亮度的一半
fn i420_planes(
  width: u32,
  height: u32,
  stride: u32,
  data: &[u8],
) -> Result<RawFrame, InvalidFrameError> {
  if stride == width {
    return RawFrame::from_i420(width, height, data);
  }

  let (_, ch) = chroma_size(width, height);
  let luma_stride = stride as usize;
  let chroma_stride = luma_stride.div_ceil(2);
  let luma = luma_stride * height as usize;
  let chroma = chroma_stride * ch as usize;
  let expected = luma + 2 * chroma;
  if data.len() < expected {
    return Err(InvalidFrameError::PlaneTooShort {
      plane: 0,
      expected,
      actual: data.len(),
    });
  }

  let y = Plane::new(data[..luma].to_vec(), luma_stride, 1);
  let u = Plane::new(data[luma..luma + chroma].to_vec(), chroma_stride, 1);
  let v = Plane::new(data[luma + chroma..expected].to_vec(), chroma_stride, 1);
  Ok(RawFrame::new(width, height, [y, u, v]))
}

impl Iterator for V4lInputFrames {
  type Item = RawFrame;

  fn next(&mut self) -> Option<Self::Item> {
    let (buffer, meta) = match CaptureStream::next(&mut self.stream) {
      Ok(frame) => frame,
      Err(e) => {
        error!("采集失败: {}", e);
        return None;
      }
    };

    let used = (meta.bytesused as usize).min(buffer.len());
    let data = if used > 0 { &buffer[..used] } else { buffer };
    match i420_planes(self.width, self.height, self.stride, data) {
      Ok(frame) => {
        let index = self.next_index;
        self.next_index += 1;
        Some(frame.with_index(index))
      }
      Err(e) => {
        error!("相机帧无效: {}", e);
        None
      }
    }
  }
}
