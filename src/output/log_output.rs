// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/log_output.rs - 日志输出
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

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, labels::ClassLabels, model::DetectionResult, output::Render,
};

#[derive(Error, Debug)]
pub enum LogOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 只把检测结果写入日志
#[derive(Default)]
pub struct LogOutput {
  labels: Arc<ClassLabels>,
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = LogOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LogOutputError::SchemeMismatch);
    }
    Ok(Self::default())
  }
}

impl LogOutput {
  pub fn with_labels(mut self, labels: Arc<ClassLabels>) -> Self {
    self.labels = labels;
    self
  }
}

impl Render<DetectionResult> for LogOutput {
  type Error = LogOutputError;

  fn render_result(&self, result: &DetectionResult) -> Result<(), Self::Error> {
    info!(
      "检测到 {} 个物体, 输出图像 {}x{}",
      result.len(),
      result.output_image.width(),
      result.output_image.height()
    );
    for detection in result.detections.iter() {
      let [x_min, y_min, x_max, y_max] = detection.corners();
      match self.labels.caption(detection) {
        Ok(caption) => info!(
          "{} [{:.1}, {:.1}, {:.1}, {:.1}]",
          caption, x_min, y_min, x_max, y_max
        ),
        Err(e) => warn!("{}, 置信度 {:.2}", e, detection.confidence()),
      }
    }
    Ok(())
  }
}
