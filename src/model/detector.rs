// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/detector.rs - 检测器
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

use tracing::{debug, info};

use crate::{
  frame::EncodedFrame,
  model::{
    BOX_OUTPUT_NAME, BOX_RECORD_LEN, DetectionBox, DetectionResult, IMAGE_OUTPUT_NAME,
    INPUT_NAME, InferenceError, InferenceSession, Model, ModelOutputs, SessionError,
  },
};

/// 持有推理会话，每帧执行一次推理
pub struct Detector<S> {
  session: S,
  frames: u64,
}

impl<S: InferenceSession> Detector<S> {
  pub fn new(session: S) -> Self {
    Self { session, frames: 0 }
  }

  /// 已完成推理的帧数
  pub fn frames(&self) -> u64 {
    self.frames
  }

  pub fn detect(&mut self, frame: &EncodedFrame) -> Result<DetectionResult, InferenceError> {
    debug!("输入图像大小: {} 字节", frame.len());
    let tensor = self
      .session
      .create_tensor(INPUT_NAME, &[frame.len()], frame.as_ref())
      .map_err(InferenceError::Tensor)?;

    debug!("执行模型推理");
    let outputs = self
      .session
      .run(&tensor, &[IMAGE_OUTPUT_NAME, BOX_OUTPUT_NAME])
      .map_err(InferenceError::Run)?;

    let result = decode_outputs(&outputs);
    drop(outputs);
    drop(tensor);

    let result = result?;
    self.frames += 1;
    debug!(
      "检测到 {} 个物体, 输出图像 {}x{}",
      result.detections.len(),
      result.output_image.width(),
      result.output_image.height()
    );
    Ok(result)
  }

  /// 关闭检测器及其会话
  pub fn close(self) -> Result<(), SessionError> {
    info!("关闭推理会话, 共处理 {} 帧", self.frames);
    self.session.close()
  }
}

impl<S: InferenceSession> Model for Detector<S> {
  type Input = EncodedFrame;
  type Output = DetectionResult;
  type Error = InferenceError;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.detect(input)
  }

  fn close(self) -> Result<(), Self::Error> {
    Detector::close(self).map_err(InferenceError::Close)
  }
}

fn decode_outputs<O: ModelOutputs>(outputs: &O) -> Result<DetectionResult, InferenceError> {
  let image_bytes = outputs
    .bytes(IMAGE_OUTPUT_NAME)
    .map_err(InferenceError::Output)?;
  debug!("输出图像大小: {} 字节", image_bytes.len());
  let output_image = image::load_from_memory(image_bytes)?.to_rgb8();

  let (shape, data) = outputs
    .floats(BOX_OUTPUT_NAME)
    .map_err(InferenceError::Output)?;
  let malformed = || InferenceError::MalformedBoxes {
    shape: shape.to_vec(),
    len: data.len(),
  };

  if data.is_empty() {
    return Ok(DetectionResult {
      output_image,
      detections: Vec::new(),
    });
  }
  if shape.last() != Some(&BOX_RECORD_LEN) || data.len() % BOX_RECORD_LEN != 0 {
    return Err(malformed());
  }

  let detections = data
    .chunks_exact(BOX_RECORD_LEN)
    .map(DetectionBox::try_from)
    .collect::<Result<Vec<_>, _>>()
    .map_err(|_| malformed())?;

  Ok(DetectionResult {
    output_image,
    detections,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{ImageFormat, Rgb, RgbImage};
  use std::collections::HashMap;
  use std::io::Cursor;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default)]
  struct Counters {
    tensors_acquired: AtomicUsize,
    tensors_released: AtomicUsize,
    outputs_acquired: AtomicUsize,
    outputs_released: AtomicUsize,
    last_shape: AtomicUsize,
  }

  struct CountedTensor {
    counters: Arc<Counters>,
  }

  impl Drop for CountedTensor {
    fn drop(&mut self) {
      self.counters.tensors_released.fetch_add(1, Ordering::SeqCst);
    }
  }

  struct CountedOutputs {
    counters: Arc<Counters>,
    bytes: HashMap<String, Vec<u8>>,
    floats: HashMap<String, (Vec<usize>, Vec<f32>)>,
  }

  impl Drop for CountedOutputs {
    fn drop(&mut self) {
      self.counters.outputs_released.fetch_add(1, Ordering::SeqCst);
    }
  }

  impl ModelOutputs for CountedOutputs {
    fn bytes(&self, name: &str) -> Result<&[u8], SessionError> {
      self
        .bytes
        .get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| SessionError::MissingOutput(name.to_string()))
    }

    fn floats(&self, name: &str) -> Result<(&[usize], &[f32]), SessionError> {
      self
        .floats
        .get(name)
        .map(|(shape, data)| (shape.as_slice(), data.as_slice()))
        .ok_or_else(|| SessionError::MissingOutput(name.to_string()))
    }
  }

  struct StubSession {
    counters: Arc<Counters>,
    image: Vec<u8>,
    boxes: (Vec<usize>, Vec<f32>),
    fail_run: bool,
  }

  impl InferenceSession for StubSession {
    type Tensor = CountedTensor;
    type Outputs = CountedOutputs;

    fn create_tensor(
      &self,
      name: &str,
      shape: &[usize],
      data: &[u8],
    ) -> Result<Self::Tensor, SessionError> {
      assert_eq!(name, INPUT_NAME);
      assert_eq!(shape, &[data.len()]);
      self.counters.last_shape.store(shape[0], Ordering::SeqCst);
      self.counters.tensors_acquired.fetch_add(1, Ordering::SeqCst);
      Ok(CountedTensor {
        counters: self.counters.clone(),
      })
    }

    fn run(
      &mut self,
      _input: &Self::Tensor,
      output_names: &[&str],
    ) -> Result<Self::Outputs, SessionError> {
      assert_eq!(output_names, &[IMAGE_OUTPUT_NAME, BOX_OUTPUT_NAME]);
      if self.fail_run {
        return Err(SessionError::Runtime("stub failure".to_string()));
      }
      self.counters.outputs_acquired.fetch_add(1, Ordering::SeqCst);
      Ok(CountedOutputs {
        counters: self.counters.clone(),
        bytes: HashMap::from([(IMAGE_OUTPUT_NAME.to_string(), self.image.clone())]),
        floats: HashMap::from([(BOX_OUTPUT_NAME.to_string(), self.boxes.clone())]),
      })
    }
  }

  fn solid_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([200, 10, 10]));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
  }

  fn stub(boxes: (Vec<usize>, Vec<f32>)) -> (StubSession, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let session = StubSession {
      counters: counters.clone(),
      image: solid_png(10, 10),
      boxes,
      fail_run: false,
    };
    (session, counters)
  }

  fn assert_balanced(counters: &Counters) {
    assert_eq!(
      counters.tensors_acquired.load(Ordering::SeqCst),
      counters.tensors_released.load(Ordering::SeqCst)
    );
    assert_eq!(
      counters.outputs_acquired.load(Ordering::SeqCst),
      counters.outputs_released.load(Ordering::SeqCst)
    );
  }

  #[test]
  fn detect_decodes_image_and_boxes() {
    let (session, counters) = stub((vec![1, 6], vec![5.0, 5.0, 2.0, 2.0, 0.9, 0.0]));
    let mut detector = Detector::new(session);
    let frame = EncodedFrame::new(vec![1, 2, 3, 4, 5], 640, 640);

    let result = detector.detect(&frame).unwrap();
    assert_eq!(result.output_image.dimensions(), (10, 10));
    assert_eq!(result.detections.len(), 1);
    assert_eq!(result.detections[0].confidence(), 0.9);
    assert_eq!(result.detections[0].class_index(), Some(0));
    assert_eq!(counters.last_shape.load(Ordering::SeqCst), 5);
    assert_eq!(detector.frames(), 1);
    assert_balanced(&counters);
  }

  #[test]
  fn empty_box_output_yields_no_detections() {
    let (session, counters) = stub((vec![0, 6], vec![]));
    let mut detector = Detector::new(session);
    let result = detector.detect(&EncodedFrame::new(vec![0], 1, 1)).unwrap();
    assert!(result.is_empty());
    assert_balanced(&counters);
  }

  #[test]
  fn run_failure_releases_input_tensor() {
    let (mut session, counters) = stub((vec![0, 6], vec![]));
    session.fail_run = true;
    let mut detector = Detector::new(session);

    let err = detector.detect(&EncodedFrame::new(vec![0], 1, 1)).unwrap_err();
    assert!(matches!(err, InferenceError::Run(SessionError::Runtime(_))));
    assert_eq!(counters.tensors_acquired.load(Ordering::SeqCst), 1);
    assert_eq!(detector.frames(), 0);
    assert_balanced(&counters);
  }

  #[test]
  fn malformed_boxes_release_all_handles() {
    let (session, counters) = stub((vec![1, 5], vec![1.0, 2.0, 3.0, 4.0, 5.0]));
    let mut detector = Detector::new(session);

    let err = detector.detect(&EncodedFrame::new(vec![0], 1, 1)).unwrap_err();
    assert!(matches!(err, InferenceError::MalformedBoxes { len: 5, .. }));
    assert_eq!(counters.outputs_acquired.load(Ordering::SeqCst), 1);
    assert_balanced(&counters);
  }

  #[test]
  fn undecodable_output_image_is_an_inference_error() {
    let (mut session, counters) = stub((vec![0, 6], vec![]));
    session.image = vec![0xde, 0xad, 0xbe, 0xef];
    let mut detector = Detector::new(session);

    let err = detector.detect(&EncodedFrame::new(vec![0], 1, 1)).unwrap_err();
    assert!(matches!(err, InferenceError::Decode(_)));
    assert_balanced(&counters);
  }
}
