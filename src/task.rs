// 该文件是 Qianli （千里眼） 项目的一部分。
// src/task.rs - 任务
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
  sync::mpsc::{Receiver, channel},
  thread,
  time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::{
  adapter::FrameAdapter,
  frame::{EncodedFrame, RawFrame},
  model::{DetectionResult, Model},
  output::Render,
  pipeline::FramePipeline,
};

/// 收到中断信号后，超过该时间仍未退出则强制结束进程
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

#[derive(Default, Debug)]
pub struct OneShotTask {
  adapter: FrameAdapter,
}

impl OneShotTask {
  pub fn with_adapter(mut self, adapter: FrameAdapter) -> Self {
    self.adapter = adapter;
    self
  }
}

impl<
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = RawFrame>,
  M: Model<Input = EncodedFrame, Output = DetectionResult, Error = ME>,
  O: Render<DetectionResult, Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, mut model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let outcome = (|| -> anyhow::Result<()> {
      let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
      info!("输入帧获取成功, 开始推理...");
      let now = Instant::now();
      let encoded = self.adapter.adapt(&frame)?;
      drop(frame);
      let elapsed_a = now.elapsed();
      let result = model.infer(&encoded)?;
      let elapsed_b = now.elapsed();
      info!(
        "推理完成, 检测到 {} 个物体, 耗时: {:.2?} / {:.2?}",
        result.len(),
        elapsed_a,
        elapsed_b
      );
      output.render_result(&result)?;
      info!("渲染完成, 耗时: {:.2?}", now.elapsed());
      Ok(())
    })();

    // 无论成功与否都要释放模型，先报告任务本身的错误
    let closed = model.close();
    if let Err(e) = &outcome {
      warn!("任务失败: {}", e);
    }
    outcome?;
    closed?;
    Ok(())
  }
}

#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  adapter: FrameAdapter,
  stop: Option<Receiver<()>>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_adapter(mut self, adapter: FrameAdapter) -> Self {
    self.adapter = adapter;
    self
  }

  /// 收到信号时退出任务循环
  pub fn with_stop_signal(mut self, stop: Receiver<()>) -> Self {
    self.stop = Some(stop);
    self
  }

  /// 注册 Ctrl-C 处理；信号到达后若 30 秒内未退出则强制结束进程
  pub fn with_ctrlc(self) -> Result<Self, ctrlc::Error> {
    let (tx, rx) = channel();
    ctrlc::set_handler(move || {
      info!("收到中断信号, 准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(FORCE_EXIT_AFTER);
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
    Ok(self.with_stop_signal(rx))
  }

  fn should_stop(&self) -> bool {
    self.stop.as_ref().is_some_and(|rx| rx.try_recv().is_ok())
  }
}

impl<
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = RawFrame>,
  M: Model<Input = EncodedFrame, Output = DetectionResult, Error = ME> + Send + 'static,
  O: Render<DetectionResult, Error = RE> + Send + 'static,
> Task<I, M, O> for ContinuousTask
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    // 启动失败或工作线程崩溃时模型随之析构，由 Drop 释放推理会话
    let pipeline = FramePipeline::spawn(self.adapter, model, output)?;

    let mut offered = 0usize;
    let mut admitted = 0usize;
    for frame in input {
      offered += 1;
      if pipeline.offer(frame) {
        admitted += 1;
      }
      if self.frame_number.is_some_and(|n| admitted >= n) {
        info!("达到指定帧数 {}, 退出任务循环", admitted);
        break;
      }
      if self.should_stop() {
        warn!("中断信号接收, 退出任务循环");
        break;
      }
    }

    info!("共收到 {} 帧, 送入分析 {} 帧", offered, admitted);
    let (model, stats) = pipeline.shutdown()?;
    info!("成功 {} 帧, 失败 {} 帧", stats.processed, stats.failed);
    model.close()?;

    info!("任务完成, 退出");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{adapter::rgb_to_raw_frame, model::InferenceError};
  use image::{Rgb, RgbImage};
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  #[derive(Default)]
  struct Calls {
    infer: AtomicUsize,
    close: AtomicUsize,
    render: AtomicUsize,
  }

  struct CountingModel(Arc<Calls>);

  impl Model for CountingModel {
    type Input = EncodedFrame;
    type Output = DetectionResult;
    type Error = InferenceError;

    fn infer(&mut self, input: &EncodedFrame) -> Result<DetectionResult, InferenceError> {
      self.0.infer.fetch_add(1, Ordering::SeqCst);
      Ok(DetectionResult {
        output_image: RgbImage::new(input.width(), input.height()),
        detections: Vec::new(),
      })
    }

    fn close(self) -> Result<(), InferenceError> {
      self.0.close.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  struct CountingRender(Arc<Calls>);

  impl Render<DetectionResult> for CountingRender {
    type Error = std::io::Error;

    fn render_result(&self, result: &DetectionResult) -> Result<(), Self::Error> {
      assert_eq!(result.output_image.dimensions(), (32, 32));
      self.0.render.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  struct FailingRender;

  impl Render<DetectionResult> for FailingRender {
    type Error = std::io::Error;

    fn render_result(&self, _result: &DetectionResult) -> Result<(), Self::Error> {
      Err(std::io::Error::other("磁盘已满"))
    }
  }

  fn frames(count: usize) -> impl Iterator<Item = RawFrame> {
    let image = RgbImage::from_pixel(48, 24, Rgb([90, 120, 30]));
    (0..count as u64).map(move |i| rgb_to_raw_frame(&image).with_index(i))
  }

  #[test]
  fn one_shot_adapts_infers_renders_and_closes() {
    let calls = Arc::new(Calls::default());
    OneShotTask::default()
      .with_adapter(FrameAdapter::default().with_target(32, 32))
      .run_task(
        frames(3),
        CountingModel(calls.clone()),
        CountingRender(calls.clone()),
      )
      .unwrap();

    assert_eq!(calls.infer.load(Ordering::SeqCst), 1);
    assert_eq!(calls.render.load(Ordering::SeqCst), 1);
    assert_eq!(calls.close.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn one_shot_without_frames_fails() {
    let calls = Arc::new(Calls::default());
    let result = OneShotTask::default().run_task(
      frames(0),
      CountingModel(calls.clone()),
      CountingRender(calls.clone()),
    );
    assert!(result.is_err());
    assert_eq!(calls.infer.load(Ordering::SeqCst), 0);
    assert_eq!(calls.close.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn one_shot_closes_the_model_when_rendering_fails() {
    let calls = Arc::new(Calls::default());
    let err = OneShotTask::default()
      .with_adapter(FrameAdapter::default().with_target(32, 32))
      .run_task(frames(1), CountingModel(calls.clone()), FailingRender)
      .unwrap_err();

    assert!(err.to_string().contains("磁盘已满"));
    assert_eq!(calls.infer.load(Ordering::SeqCst), 1);
    assert_eq!(calls.close.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn continuous_task_closes_the_model_after_the_input_ends() {
    let calls = Arc::new(Calls::default());
    ContinuousTask::default()
      .with_adapter(FrameAdapter::default().with_target(32, 32))
      .run_task(
        frames(5),
        CountingModel(calls.clone()),
        CountingRender(calls.clone()),
      )
      .unwrap();

    let inferred = calls.infer.load(Ordering::SeqCst);
    assert!((1..=5).contains(&inferred));
    assert_eq!(calls.render.load(Ordering::SeqCst), inferred);
    assert_eq!(calls.close.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn continuous_task_stops_on_signal() {
    let calls = Arc::new(Calls::default());
    let (tx, rx) = channel();
    tx.send(()).unwrap();

    ContinuousTask::default()
      .with_adapter(FrameAdapter::default().with_target(32, 32))
      .with_stop_signal(rx)
      .run_task(
        frames(1000),
        CountingModel(calls.clone()),
        CountingRender(calls.clone()),
      )
      .unwrap();

    assert!(calls.infer.load(Ordering::SeqCst) <= 1);
    assert_eq!(calls.close.load(Ordering::SeqCst), 1);
  }
}
