// 该文件是 Qianli （千里眼） 项目的一部分。
// src/pipeline.rs - 帧分析流水线
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

//! 相机线程与单个分析线程之间是容量为 1 的通道。
//! 相机侧只做非阻塞的 `offer`，处理中到达的帧被丢弃而不是排队。

use std::{
  sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel},
  thread::{self, JoinHandle},
  time::Instant,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  adapter::FrameAdapter,
  frame::{EncodedFrame, RawFrame},
  gate::{Admitted, FrameGate},
  model::{DetectionResult, Model},
  output::Render,
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("分析线程创建失败: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("分析线程异常退出")]
  WorkerPanicked,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
  /// 成功完成检测与渲染的帧数
  pub processed: u64,
  /// 处理失败被丢弃的帧数
  pub failed: u64,
}

pub struct FramePipeline<M> {
  gate: FrameGate,
  sender: Option<SyncSender<Admitted>>,
  worker: Option<JoinHandle<(M, PipelineStats)>>,
}

impl<M, ME> FramePipeline<M>
where
  M: Model<Input = EncodedFrame, Output = DetectionResult, Error = ME> + Send + 'static,
  ME: std::error::Error + Send + Sync + 'static,
{
  pub fn spawn<O, RE>(adapter: FrameAdapter, model: M, output: O) -> Result<Self, PipelineError>
  where
    O: Render<DetectionResult, Error = RE> + Send + 'static,
    RE: std::error::Error + Send + Sync + 'static,
  {
    let (sender, receiver) = sync_channel::<Admitted>(1);
    let worker = thread::Builder::new()
      .name("frame-analysis".to_string())
      .spawn(move || run_worker(receiver, adapter, model, output))?;

    Ok(Self {
      gate: FrameGate::new(),
      sender: Some(sender),
      worker: Some(worker),
    })
  }

  /// 非阻塞地提交一帧，返回是否被接纳
  pub fn offer(&self, frame: RawFrame) -> bool {
    let Some(sender) = self.sender.as_ref() else {
      return false;
    };
    let Some(ticket) = self.gate.try_admit(frame) else {
      return false;
    };

    match sender.try_send(ticket) {
      Ok(()) => true,
      Err(TrySendError::Full(ticket)) => {
        warn!("分析通道已满, 丢弃第 {} 帧", ticket.frame().index());
        false
      }
      Err(TrySendError::Disconnected(ticket)) => {
        error!("分析线程已退出, 丢弃第 {} 帧", ticket.frame().index());
        false
      }
    }
  }

  pub fn gate(&self) -> &FrameGate {
    &self.gate
  }

  /// 停止接收新帧，等待分析线程处理完手上的帧后退出，交还模型
  pub fn shutdown(mut self) -> Result<(M, PipelineStats), PipelineError> {
    drop(self.sender.take());
    let worker = self.worker.take().ok_or(PipelineError::WorkerPanicked)?;
    let (model, stats) = worker.join().map_err(|_| PipelineError::WorkerPanicked)?;
    info!(
      "流水线关闭: 接纳 {} 帧, 丢弃 {} 帧, 成功 {} 帧, 失败 {} 帧",
      self.gate.admitted(),
      self.gate.dropped(),
      stats.processed,
      stats.failed
    );
    Ok((model, stats))
  }
}

impl<M> Drop for FramePipeline<M> {
  fn drop(&mut self) {
    drop(self.sender.take());
    if let Some(worker) = self.worker.take()
      && worker.join().is_err()
    {
      error!("分析线程异常退出");
    }
  }
}

fn process_frame<M, ME, O, RE>(
  adapter: &FrameAdapter,
  model: &mut M,
  output: &O,
  frame: &RawFrame,
) -> anyhow::Result<usize>
where
  M: Model<Input = EncodedFrame, Output = DetectionResult, Error = ME>,
  ME: std::error::Error + Send + Sync + 'static,
  O: Render<DetectionResult, Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  let encoded = adapter.adapt(frame)?;
  let result = model.infer(&encoded)?;
  output.render_result(&result)?;
  Ok(result.detections.len())
}

fn run_worker<M, ME, O, RE>(
  receiver: Receiver<Admitted>,
  adapter: FrameAdapter,
  mut model: M,
  output: O,
) -> (M, PipelineStats)
where
  M: Model<Input = EncodedFrame, Output = DetectionResult, Error = ME>,
  ME: std::error::Error + Send + Sync + 'static,
  O: Render<DetectionResult, Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  info!("分析线程启动");
  let mut stats = PipelineStats::default();

  for ticket in receiver {
    let index = ticket.frame().index();
    let now = Instant::now();
    match process_frame(&adapter, &mut model, &output, ticket.frame()) {
      Ok(count) => {
        stats.processed += 1;
        debug!(
          "第 {} 帧处理完成: 检测到 {} 个物体, 耗时: {:.2?}",
          index,
          count,
          now.elapsed()
        );
      }
      Err(e) => {
        stats.failed += 1;
        error!("第 {} 帧处理失败: {:#}", index, e);
      }
    }
    drop(ticket);
  }

  info!("分析线程退出");
  (model, stats)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{adapter::rgb_to_raw_frame, model::InferenceError};
  use image::{Rgb, RgbImage};
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc::{self, Receiver, Sender},
  };
  use std::time::Duration;

  /// 每次推理前等待放行信号
  struct GatedModel {
    started: Sender<()>,
    proceed: Receiver<()>,
    fail: bool,
  }

  impl Model for GatedModel {
    type Input = EncodedFrame;
    type Output = DetectionResult;
    type Error = InferenceError;

    fn infer(&mut self, _input: &EncodedFrame) -> Result<DetectionResult, InferenceError> {
      let _ = self.started.send(());
      let _ = self.proceed.recv();
      if self.fail {
        return Err(InferenceError::MalformedBoxes {
          shape: vec![1, 5],
          len: 5,
        });
      }
      Ok(DetectionResult {
        output_image: RgbImage::new(4, 4),
        detections: Vec::new(),
      })
    }
  }

  struct CountingRender(Arc<AtomicUsize>);

  impl Render<DetectionResult> for CountingRender {
    type Error = std::io::Error;

    fn render_result(&self, _result: &DetectionResult) -> Result<(), Self::Error> {
      self.0.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  fn frame(index: u64, released: &Arc<AtomicUsize>) -> RawFrame {
    let released = released.clone();
    rgb_to_raw_frame(&RgbImage::from_pixel(16, 16, Rgb([10, 20, 30])))
      .with_index(index)
      .with_release(move || {
        released.fetch_add(1, Ordering::SeqCst);
      })
  }

  fn gated(fail: bool) -> (GatedModel, Receiver<()>, Sender<()>) {
    let (started_tx, started_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    let model = GatedModel {
      started: started_tx,
      proceed: proceed_rx,
      fail,
    };
    (model, started_rx, proceed_tx)
  }

  #[test]
  fn frames_offered_while_busy_are_dropped() {
    let (model, started, proceed) = gated(false);
    let rendered = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let adapter = FrameAdapter::default().with_target(16, 16);
    let pipeline =
      FramePipeline::spawn(adapter, model, CountingRender(rendered.clone())).unwrap();

    assert!(pipeline.offer(frame(0, &released)));
    started.recv_timeout(Duration::from_secs(10)).unwrap();

    let admitted = (1..=4).filter(|&i| pipeline.offer(frame(i, &released))).count();
    assert_eq!(admitted, 0);
    assert_eq!(released.load(Ordering::SeqCst), 4);

    proceed.send(()).unwrap();
    let (_model, stats) = pipeline.shutdown().unwrap();
    assert_eq!(stats, PipelineStats { processed: 1, failed: 0 });
    assert_eq!(rendered.load(Ordering::SeqCst), 1);
    assert_eq!(released.load(Ordering::SeqCst), 5);
  }

  #[test]
  fn failed_frame_is_released_and_gate_rearmed() {
    let (model, started, proceed) = gated(true);
    let rendered = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let adapter = FrameAdapter::default().with_target(16, 16);
    let pipeline =
      FramePipeline::spawn(adapter, model, CountingRender(rendered.clone())).unwrap();

    assert!(pipeline.offer(frame(0, &released)));
    started.recv_timeout(Duration::from_secs(10)).unwrap();
    proceed.send(()).unwrap();

    // 等待失败路径释放帧并清除忙碌标志
    let deadline = Instant::now() + Duration::from_secs(10);
    while pipeline.gate().is_busy() && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
    }
    assert!(!pipeline.gate().is_busy());
    assert_eq!(released.load(Ordering::SeqCst), 1);

    assert!(pipeline.offer(frame(1, &released)));
    started.recv_timeout(Duration::from_secs(10)).unwrap();
    proceed.send(()).unwrap();

    let (_model, stats) = pipeline.shutdown().unwrap();
    assert_eq!(stats, PipelineStats { processed: 0, failed: 2 });
    assert_eq!(rendered.load(Ordering::SeqCst), 0);
    assert_eq!(released.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn invalid_frame_is_counted_as_failure() {
    let (model, _started, proceed) = gated(false);
    let rendered = Arc::new(AtomicUsize::new(0));
    let pipeline = FramePipeline::spawn(
      FrameAdapter::default(),
      model,
      CountingRender(rendered.clone()),
    )
    .unwrap();

    assert!(pipeline.offer(RawFrame::empty(640, 640)));
    drop(proceed);
    let (_model, stats) = pipeline.shutdown().unwrap();
    assert_eq!(stats, PipelineStats { processed: 0, failed: 1 });
    assert_eq!(rendered.load(Ordering::SeqCst), 0);
  }
}
