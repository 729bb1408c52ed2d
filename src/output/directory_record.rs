// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::{
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicU16, Ordering},
  },
};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  labels::ClassLabels,
  model::DetectionResult,
  output::{
    Render,
    draw::{Draw, DrawError, Record},
  },
  url_file_path, url_query,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
}

pub enum DrawWrapper {
  Draw(Box<Draw>),
  Record(Record),
}

impl DrawWrapper {
  pub fn save_result(
    &self,
    path: &Path,
    result: &DetectionResult,
  ) -> Result<(), DirectoryRecordOutputError> {
    match self {
      DrawWrapper::Draw(draw) => {
        draw.draw_result(result).save(path)?;
      }
      DrawWrapper::Record(record) => {
        result.output_image.save(path)?;
        record.record(&result.detections, path)?;
      }
    };

    Ok(())
  }

  fn with_labels(self, labels: Arc<ClassLabels>) -> Self {
    match self {
      DrawWrapper::Draw(draw) => DrawWrapper::Draw(Box::new(draw.with_labels(labels))),
      DrawWrapper::Record(record) => DrawWrapper::Record(Record { labels, ..record }),
    }
  }
}

/// `folder:///path/to/dir[?record=name|id][&always][&font=/path/to/font.ttf]`
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: DrawWrapper,
  frame_counter: AtomicU16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let draw = match url_query(uri, "record").as_deref() {
      Some("id") => DrawWrapper::Record(Record {
        label_with_name: false,
        labels: Arc::default(),
      }),
      Some(_) => DrawWrapper::Record(Record {
        label_with_name: true,
        labels: Arc::default(),
      }),
      None => {
        let draw = match url_query(uri, "font") {
          Some(font) => Draw::default().with_font_file(font)?,
          None => Draw::default(),
        };
        DrawWrapper::Draw(Box::new(draw))
      }
    };

    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(url_file_path(uri)),
      draw,
      frame_counter: AtomicU16::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn with_labels(mut self, labels: Arc<ClassLabels>) -> Self {
    self.draw = self.draw.with_labels(labels);
    self
  }

  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render<DetectionResult> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, result: &DetectionResult) -> Result<(), Self::Error> {
    if !self.always && result.is_empty() {
      debug!("无检测结果, 跳过保存");
      return Ok(());
    }
    let path = self.frame_path()?;
    self.draw.save_result(&path, result)?;
    debug!("保存检测结果: {}", path.display());
    Ok(())
  }
}
