// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理会话
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
  collections::HashMap,
  path::{Path, PathBuf},
};

use ort::{session::Session, value::Tensor};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  adapter::{DEFAULT_INPUT_HEIGHT, DEFAULT_INPUT_WIDTH},
  model::{InferenceSession, ModelOutputs, SessionError, SessionInitError},
  url_file_path, url_query,
};

/// 模型文件与自定义算子库
///
/// `onnx:///path/to/model.onnx?ops=/path/to/libortextensions.so&width=640&height=640&threads=2`
pub struct OnnxSessionBuilder {
  model_path: PathBuf,
  ops_library: Option<PathBuf>,
  input_size: (u32, u32),
  intra_threads: Option<usize>,
}

impl FromUrlWithScheme for OnnxSessionBuilder {
  const SCHEME: &'static str = "onnx";
}

fn parse_param<T: std::str::FromStr>(url: &Url, key: &str) -> Result<Option<T>, SessionInitError> {
  url_query(url, key)
    .map(|v| {
      v.parse::<T>()
        .map_err(|_| SessionInitError::InvalidParameter(format!("{}={}", key, v)))
    })
    .transpose()
}

impl FromUrl for OnnxSessionBuilder {
  type Error = SessionInitError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SessionInitError::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let width = parse_param::<u32>(url, "width")?.unwrap_or(DEFAULT_INPUT_WIDTH);
    let height = parse_param::<u32>(url, "height")?.unwrap_or(DEFAULT_INPUT_HEIGHT);
    if width == 0 || height == 0 {
      return Err(SessionInitError::InvalidParameter(format!(
        "输入尺寸不能为零: {}x{}",
        width, height
      )));
    }

    Ok(Self {
      model_path: PathBuf::from(url_file_path(url)),
      ops_library: url_query(url, "ops").map(PathBuf::from),
      input_size: (width, height),
      intra_threads: parse_param::<usize>(url, "threads")?,
    })
  }
}

impl OnnxSessionBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      ops_library: None,
      input_size: (DEFAULT_INPUT_WIDTH, DEFAULT_INPUT_HEIGHT),
      intra_threads: None,
    }
  }

  pub fn ops_library(mut self, path: impl Into<PathBuf>) -> Self {
    self.ops_library = Some(path.into());
    self
  }

  pub fn intra_threads(mut self, threads: usize) -> Self {
    self.intra_threads = Some(threads);
    self
  }

  /// 模型要求的输入分辨率
  pub fn input_size(&self) -> (u32, u32) {
    self.input_size
  }

  pub fn model_path(&self) -> &Path {
    &self.model_path
  }

  pub fn build(self) -> Result<OnnxSession, SessionInitError> {
    info!("加载模型文件: {}", self.model_path.display());
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    if let Some(path) = &self.ops_library
      && !path.exists()
    {
      return Err(SessionInitError::OperatorLibrary {
        path: path.display().to_string(),
        reason: "文件不存在".to_string(),
      });
    }

    let mut builder = Session::builder().map_err(|e| SessionInitError::Runtime(e.to_string()))?;

    if let Some(threads) = self.intra_threads {
      debug!("推理线程数: {}", threads);
      builder = builder
        .with_intra_threads(threads)
        .map_err(|e| SessionInitError::Runtime(e.to_string()))?;
    }

    match &self.ops_library {
      Some(path) => {
        info!("注册自定义算子库: {}", path.display());
        builder = builder
          .with_operator_library(path)
          .map_err(|e| SessionInitError::OperatorLibrary {
            path: path.display().to_string(),
            reason: e.to_string(),
          })?;
      }
      None => warn!("未指定自定义算子库, 依赖预处理算子的模型将无法加载"),
    }

    info!("创建 ONNX 推理会话");
    let session = builder
      .commit_from_memory(&model_data)
      .map_err(|e| SessionInitError::Runtime(e.to_string()))?;
    info!("模型加载完成");

    Ok(OnnxSession {
      session,
      model_path: self.model_path,
    })
  }
}

pub struct OnnxSession {
  session: Session,
  model_path: PathBuf,
}

pub struct OnnxTensor {
  name: String,
  tensor: Tensor<u8>,
}

enum OwnedOutput {
  Bytes(Vec<u8>),
  Floats(Vec<usize>, Vec<f32>),
}

/// 从运行时拷出的输出，运行时句柄在 `run` 返回前已释放
pub struct OnnxOutputs {
  values: HashMap<String, OwnedOutput>,
}

fn runtime_error(e: ort::Error) -> SessionError {
  SessionError::Runtime(e.to_string())
}

impl InferenceSession for OnnxSession {
  type Tensor = OnnxTensor;
  type Outputs = OnnxOutputs;

  fn create_tensor(
    &self,
    name: &str,
    shape: &[usize],
    data: &[u8],
  ) -> Result<Self::Tensor, SessionError> {
    if shape != [data.len()] {
      return Err(SessionError::Runtime(format!(
        "输入张量形状 {:?} 与数据长度 {} 不一致",
        shape,
        data.len()
      )));
    }
    let tensor =
      Tensor::from_array(([data.len()], data.to_vec().into_boxed_slice())).map_err(runtime_error)?;
    debug!("输入张量 {} 形状: [{}]", name, data.len());
    Ok(OnnxTensor {
      name: name.to_string(),
      tensor,
    })
  }

  fn run(
    &mut self,
    input: &Self::Tensor,
    output_names: &[&str],
  ) -> Result<Self::Outputs, SessionError> {
    let outputs = self
      .session
      .run(ort::inputs![input.name.as_str() => input.tensor.view()])
      .map_err(runtime_error)?;

    let mut values = HashMap::with_capacity(output_names.len());
    for &name in output_names {
      let value = outputs
        .get(name)
        .ok_or_else(|| SessionError::MissingOutput(name.to_string()))?;

      let owned = if let Ok((_, data)) = value.try_extract_tensor::<u8>() {
        OwnedOutput::Bytes(data.to_vec())
      } else if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
        let shape = shape.iter().map(|&d| d.max(0) as usize).collect();
        OwnedOutput::Floats(shape, data.to_vec())
      } else {
        return Err(SessionError::OutputType {
          name: name.to_string(),
          expected: "u8 或 f32 张量",
        });
      };
      values.insert(name.to_string(), owned);
    }

    Ok(OnnxOutputs { values })
  }

  fn close(self) -> Result<(), SessionError> {
    info!("释放模型: {}", self.model_path.display());
    drop(self.session);
    Ok(())
  }
}

impl ModelOutputs for OnnxOutputs {
  fn bytes(&self, name: &str) -> Result<&[u8], SessionError> {
    match self.values.get(name) {
      Some(OwnedOutput::Bytes(data)) => Ok(data),
      Some(OwnedOutput::Floats(..)) => Err(SessionError::OutputType {
        name: name.to_string(),
        expected: "u8 张量",
      }),
      None => Err(SessionError::MissingOutput(name.to_string())),
    }
  }

  fn floats(&self, name: &str) -> Result<(&[usize], &[f32]), SessionError> {
    match self.values.get(name) {
      Some(OwnedOutput::Floats(shape, data)) => Ok((shape, data)),
      Some(OwnedOutput::Bytes(_)) => Err(SessionError::OutputType {
        name: name.to_string(),
        expected: "f32 张量",
      }),
      None => Err(SessionError::MissingOutput(name.to_string())),
    }
  }
}
