// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, adapter::rgb_to_raw_frame, frame::RawFrame, url_file_path,
  url_query,
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("参数错误: {0}")]
  InvalidParameter(String),
}

/// 把静态图像当作相机，输出 I420 帧
///
/// `image:///path/to/input.jpg?repeat=10`
pub struct ImageFileInput {
  image: RgbImage,
  repeat: u64,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let repeat = match url_query(url, "repeat") {
      Some(v) => v
        .parse::<u64>()
        .map_err(|_| ImageFileInputError::InvalidParameter(format!("repeat={}", v)))?,
      None => 1,
    };

    let path = url_file_path(url);
    info!("读取图像文件: {}", path);
    let image = ImageReader::open(&path)?.with_guessed_format()?.decode()?;

    Ok(ImageFileInput {
      image: image.to_rgb8(),
      repeat,
    })
  }
}

impl ImageFileInput {
  pub fn new(image: RgbImage) -> Self {
    Self { image, repeat: 1 }
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.image.dimensions()
  }

  pub fn into_frames(self) -> ImageFileInputFrames {
    ImageFileInputFrames {
      image: self.image,
      remaining: self.repeat,
      next_index: 0,
    }
  }
}

pub struct ImageFileInputFrames {
  image: RgbImage,
  remaining: u64,
  next_index: u64,
}

impl Iterator for ImageFileInputFrames {
  type Item = RawFrame;

  fn next(&mut self) -> Option<Self::Item> {
    if self.remaining == 0 {
      return None;
    }
    self.remaining -= 1;
    let index = self.next_index;
    self.next_index += 1;
    Some(rgb_to_raw_frame(&self.image).with_index(index))
  }
}
