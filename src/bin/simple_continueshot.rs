// 该文件是 Qianli （千里眼） 项目的一部分。
// src/bin/simple_continueshot.rs - 连续帧检测
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

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use url::Url;

use qianli::{
  FromUrl,
  adapter::FrameAdapter,
  input::InputWrapper,
  labels::ClassLabels,
  model::{Detector, OnnxSessionBuilder},
  output::OutputWrapper,
  task::{ContinuousTask, Task},
};
use tracing::info;

/// Qianli 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型，例如 onnx:///path/model.onnx?ops=/path/libortextensions.so
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 v4l:///dev/video0?width=1280&height=720
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 类别标签文件，每行一个
  #[arg(long, value_name = "LABELS")]
  pub labels: PathBuf,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let labels = Arc::new(ClassLabels::load(&args.labels)?);

  // 会话创建失败时不打开相机
  let builder = OnnxSessionBuilder::from_url(&args.model)?;
  let (width, height) = builder.input_size();
  let detector = Detector::new(builder.build()?);

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?.with_labels(labels);

  ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .with_adapter(FrameAdapter::default().with_target(width, height))
    .with_ctrlc()?
    .run_task(input.into_frames()?, detector, output)?;

  Ok(())
}
