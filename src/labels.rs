// 该文件是 Qianli （千里眼） 项目的一部分。
// src/labels.rs - 类别标签表
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

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::model::DetectionBox;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标签文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标签文件为空")]
  Empty,
  #[error("类别索引 {index} 超出范围, 共 {len} 个标签")]
  OutOfRange { index: f32, len: usize },
}

/// 按行排列的类别标签，行号即类别索引
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassLabels {
  labels: Vec<String>,
}

impl ClassLabels {
  pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
    Self {
      labels: labels.into_iter().map(Into::into).collect(),
    }
  }

  pub fn parse(text: &str) -> Result<Self, LabelError> {
    let mut labels: Vec<String> = text
      .lines()
      .map(|line| line.trim_end_matches('\r').to_string())
      .collect();
    while labels.last().is_some_and(|l| l.is_empty()) {
      labels.pop();
    }
    if labels.is_empty() {
      return Err(LabelError::Empty);
    }
    Ok(Self { labels })
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let path = path.as_ref();
    info!("加载标签文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let labels = Self::parse(&text)?;
    debug!("共 {} 个类别", labels.len());
    Ok(labels)
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.labels.get(index).map(String::as_str)
  }

  /// 查找检测框对应的标签，索引越界或不是非负整数时返回错误
  pub fn label_of(&self, detection: &DetectionBox) -> Result<&str, LabelError> {
    let raw = detection.raw_class_index();
    detection
      .class_index()
      .and_then(|index| self.get(index))
      .ok_or(LabelError::OutOfRange {
        index: raw,
        len: self.len(),
      })
  }

  /// 渲染用的标签文本，例如 `dog:0.90`
  pub fn caption(&self, detection: &DetectionBox) -> Result<String, LabelError> {
    let label = self.label_of(detection)?;
    Ok(format!("{}:{:.2}", label, detection.confidence()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(class_index: f32) -> DetectionBox {
    DetectionBox::from([5.0, 5.0, 2.0, 2.0, 0.9, class_index])
  }

  #[test]
  fn class_index_maps_to_label() {
    let labels = ClassLabels::new(["cat", "dog"]);
    assert_eq!(labels.label_of(&detection(1.0)).unwrap(), "dog");
    assert_eq!(labels.caption(&detection(1.0)).unwrap(), "dog:0.90");
  }

  #[test]
  fn out_of_range_index_is_an_error() {
    let labels = ClassLabels::new(["cat", "dog"]);
    let err = labels.label_of(&detection(2.0)).unwrap_err();
    assert!(matches!(err, LabelError::OutOfRange { len: 2, .. }));
    assert!(labels.label_of(&detection(-1.0)).is_err());
    assert!(labels.label_of(&detection(f32::NAN)).is_err());
  }

  #[test]
  fn parse_strips_carriage_returns_and_trailing_blank_lines() {
    let labels = ClassLabels::parse("person\r\nbicycle\r\n\n").unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels.get(1), Some("bicycle"));
  }

  #[test]
  fn empty_file_is_rejected() {
    assert!(matches!(ClassLabels::parse("\n\n"), Err(LabelError::Empty)));
  }

  #[test]
  fn load_reads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("classes.txt");
    std::fs::write(&path, "cat\ndog\n").unwrap();
    let labels = ClassLabels::load(&path).unwrap();
    assert_eq!(labels, ClassLabels::new(["cat", "dog"]));
  }
}
