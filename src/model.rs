// 该文件是 Kanjian （看见） 项目的一部分。
// src/model.rs - 模型描述与推理引擎
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

use std::{collections::BTreeMap, path::PathBuf, time::Instant};

use image::imageops::{self, FilterType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{FromUrl, config::ModelConfig, frame::Frame};

pub mod cache;
pub mod resnet18;

pub use self::cache::{ActivationCache, CachedEngine};

/// 网络输入边长
pub const INPUT_SIZE: u32 = 224;
/// ImageNet 通道均值
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet 通道标准差
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
/// 未指定时默认观察的层
pub const DEFAULT_ACTIVE_LAYERS: [&str; 5] = ["conv1", "layer1", "layer2", "layer3", "layer4"];

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("不支持的模型: {0}")]
  UnsupportedModel(String),
  #[error("模型 {model} 中不存在层 {layer}")]
  UnknownLayer { model: String, layer: String },
  #[error("推理失败: {0}")]
  InferenceFailure(String),
  #[error("激活张量格式错误: {0}")]
  MalformedActivation(String),
  #[error("模型加载错误: {0}")]
  ModelLoad(String),
}

/// 层注册表中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
  /// 对外使用的层标识，如 `layer2`
  pub id: String,
  /// 计算图中对应的节点名
  pub node: String,
  pub channels: usize,
}

impl LayerSpec {
  pub fn new(id: impl Into<String>, node: impl Into<String>, channels: usize) -> Self {
    Self {
      id: id.into(),
      node: node.into(),
      channels,
    }
  }
}

/// 模型描述：名称、权重标识以及可观察层的注册表
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
  name: String,
  weights: String,
  path: Option<PathBuf>,
  layers: Vec<LayerSpec>,
}

impl ModelDescriptor {
  pub fn new(
    name: &str,
    weights: impl Into<String>,
    path: Option<PathBuf>,
  ) -> Result<Self, ModelError> {
    let layers = match name {
      resnet18::NAME => resnet18::layer_registry(),
      _ => {
        error!("不支持的模型: {}", name);
        return Err(ModelError::UnsupportedModel(name.to_string()));
      }
    };

    Ok(Self {
      name: name.to_string(),
      weights: weights.into(),
      path,
      layers,
    })
  }

  pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
    Self::new(&config.name, config.weights.clone(), config.path.clone())
  }

  /// 自定义注册表，配合 [`InferenceEngine::with_backbone`] 使用
  pub fn custom(name: impl Into<String>, layers: Vec<LayerSpec>) -> Self {
    Self {
      name: name.into(),
      weights: String::new(),
      path: None,
      layers,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn weights(&self) -> &str {
    &self.weights
  }

  pub fn path(&self) -> Option<&PathBuf> {
    self.path.as_ref()
  }

  pub fn layers(&self) -> &[LayerSpec] {
    &self.layers
  }

  pub fn layer(&self, id: &str) -> Option<&LayerSpec> {
    self.layers.iter().find(|layer| layer.id == id)
  }
}

/// 单层激活，形状为 (1, C, H, W)
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationTensor {
  layer: String,
  shape: [usize; 4],
  data: Vec<f32>,
}

impl ActivationTensor {
  pub fn new(
    layer: impl Into<String>,
    shape: [usize; 4],
    data: Vec<f32>,
  ) -> Result<Self, ModelError> {
    let layer = layer.into();
    if shape[0] != 1 {
      return Err(ModelError::MalformedActivation(format!(
        "层 {} 的批大小为 {}，期望为 1",
        layer, shape[0]
      )));
    }
    if shape.iter().any(|&dim| dim == 0) {
      return Err(ModelError::MalformedActivation(format!(
        "层 {} 的形状为空: {:?}",
        layer, shape
      )));
    }
    let expected: usize = shape.iter().product();
    if data.len() != expected {
      return Err(ModelError::MalformedActivation(format!(
        "层 {} 数据长度 {} 与形状 {:?} 不符",
        layer,
        data.len(),
        shape
      )));
    }

    Ok(Self { layer, shape, data })
  }

  /// 从任意维度的形状构造，非 4 维的输出视为格式错误
  pub fn from_dyn_shape(
    layer: impl Into<String>,
    shape: &[usize],
    data: Vec<f32>,
  ) -> Result<Self, ModelError> {
    let layer = layer.into();
    let shape: [usize; 4] = shape.try_into().map_err(|_| {
      ModelError::MalformedActivation(format!("层 {} 输出维度为 {:?}，期望 4 维", layer, shape))
    })?;
    Self::new(layer, shape, data)
  }

  pub fn layer(&self) -> &str {
    &self.layer
  }

  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn channels(&self) -> usize {
    self.shape[1]
  }

  pub fn height(&self) -> usize {
    self.shape[2]
  }

  pub fn width(&self) -> usize {
    self.shape[3]
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }

  /// 第 `c` 个通道的平面数据（行优先）
  pub fn channel(&self, c: usize) -> Option<&[f32]> {
    if c >= self.channels() {
      return None;
    }
    let plane = self.height() * self.width();
    Some(&self.data[c * plane..(c + 1) * plane])
  }
}

/// 一次推理的结果：层标识 → 激活
pub type Activations = BTreeMap<String, ActivationTensor>;

/// 预处理后的网络输入，NCHW 排列
#[derive(Debug, Clone)]
pub struct InputTensor {
  shape: [usize; 4],
  data: Vec<f32>,
}

impl InputTensor {
  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }
}

/// 缩放到 224×224 并按 ImageNet 均值/标准差归一化
pub fn preprocess(frame: &Frame) -> InputTensor {
  let side = INPUT_SIZE as usize;
  let resized = imageops::resize(
    &frame.to_rgb_image(),
    INPUT_SIZE,
    INPUT_SIZE,
    FilterType::Triangle,
  );

  let plane = side * side;
  let mut data = vec![0f32; 3 * plane];
  for (index, pixel) in resized.pixels().enumerate() {
    for c in 0..3 {
      let value = pixel[c] as f32 / 255.0;
      data[c * plane + index] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
    }
  }

  InputTensor {
    shape: [1, 3, side, side],
    data,
  }
}

/// 前向传播期间的采集点
///
/// 每次 `infer` 都会新建一份，只记录本次调用请求的层。
#[derive(Debug)]
pub struct CapturePoints {
  layers: Vec<LayerSpec>,
  captured: Activations,
}

impl CapturePoints {
  pub fn new(layers: &[LayerSpec]) -> Self {
    Self {
      layers: layers.to_vec(),
      captured: Activations::new(),
    }
  }

  pub fn layers(&self) -> &[LayerSpec] {
    &self.layers
  }

  pub fn wants(&self, layer: &str) -> bool {
    self.layers.iter().any(|spec| spec.id == layer)
  }

  pub fn record(&mut self, tensor: ActivationTensor) {
    if !self.wants(tensor.layer()) {
      debug!("忽略未请求的层: {}", tensor.layer());
      return;
    }
    self.captured.insert(tensor.layer().to_string(), tensor);
  }

  fn into_activations(self) -> Result<Activations, ModelError> {
    if let Some(missing) = self
      .layers
      .iter()
      .find(|spec| !self.captured.contains_key(&spec.id))
    {
      return Err(ModelError::InferenceFailure(format!(
        "层 {} 没有产生激活",
        missing.id
      )));
    }
    Ok(self.captured)
  }
}

/// 执行前向传播的骨干网络
pub trait Backbone: Send {
  fn forward(&self, input: &InputTensor, capture: &mut CapturePoints) -> Result<(), ModelError>;
}

/// 推理引擎：一次前向传播，返回所有激活层的输出
pub struct InferenceEngine {
  descriptor: ModelDescriptor,
  active: Vec<LayerSpec>,
  backbone: Box<dyn Backbone>,
}

impl InferenceEngine {
  /// 按模型名称加载骨干网络，`active` 为空时使用默认的五层
  pub fn new(descriptor: ModelDescriptor, active: Option<&[&str]>) -> Result<Self, ModelError> {
    let layers = resolve_layers(&descriptor, active)?;
    let backbone: Box<dyn Backbone> = match descriptor.name() {
      resnet18::NAME => resnet18::load(&descriptor, &layers)?,
      other => return Err(ModelError::UnsupportedModel(other.to_string())),
    };
    Ok(Self {
      descriptor,
      active: layers,
      backbone,
    })
  }

  pub fn with_backbone(
    descriptor: ModelDescriptor,
    active: Option<&[&str]>,
    backbone: Box<dyn Backbone>,
  ) -> Result<Self, ModelError> {
    let layers = resolve_layers(&descriptor, active)?;
    Ok(Self {
      descriptor,
      active: layers,
      backbone,
    })
  }

  pub fn infer(&self, frame: &Frame) -> Result<Activations, ModelError> {
    let now = Instant::now();
    let input = preprocess(frame);
    let mut capture = CapturePoints::new(&self.active);
    self.backbone.forward(&input, &mut capture)?;
    let activations = capture.into_activations()?;
    debug!(
      "推理完成，{} 层，耗时: {:.2?}",
      activations.len(),
      now.elapsed()
    );
    Ok(activations)
  }

  pub fn descriptor(&self) -> &ModelDescriptor {
    &self.descriptor
  }

  pub fn get_active_layers(&self) -> Vec<&str> {
    self.active.iter().map(|spec| spec.id.as_str()).collect()
  }

  pub fn get_available_layers(&self) -> Vec<&str> {
    self
      .descriptor
      .layers()
      .iter()
      .map(|spec| spec.id.as_str())
      .collect()
  }
}

fn resolve_layers(
  descriptor: &ModelDescriptor,
  active: Option<&[&str]>,
) -> Result<Vec<LayerSpec>, ModelError> {
  let requested = active.unwrap_or(&DEFAULT_ACTIVE_LAYERS);
  let mut layers = Vec::with_capacity(requested.len());
  for &id in requested {
    let spec = descriptor.layer(id).ok_or_else(|| {
      error!("模型 {} 中不存在层 {}", descriptor.name(), id);
      ModelError::UnknownLayer {
        model: descriptor.name().to_string(),
        layer: id.to_string(),
      }
    })?;
    if !layers.contains(spec) {
      layers.push(spec.clone());
    }
  }
  Ok(layers)
}

/// 由 `resnet18:///path/to/model.onnx?weights=imagenet&layers=conv1,layer2` 构造引擎
pub struct InferenceEngineBuilder {
  descriptor: ModelDescriptor,
  layers: Option<Vec<String>>,
}

impl FromUrl for InferenceEngineBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let mut weights = String::from("imagenet");
    let mut layers = None;
    for (key, value) in url.query_pairs() {
      match &*key {
        "weights" => weights = value.into_owned(),
        "layers" => {
          layers = Some(
            value
              .split(',')
              .map(str::trim)
              .filter(|layer| !layer.is_empty())
              .map(str::to_string)
              .collect(),
          )
        }
        _ => debug!("忽略未知参数: {}={}", key, value),
      }
    }

    let path = match url.path() {
      "" | "/" => None,
      path => Some(PathBuf::from(path)),
    };
    let descriptor = ModelDescriptor::new(url.scheme(), weights, path)?;
    Ok(Self { descriptor, layers })
  }
}

impl InferenceEngineBuilder {
  pub fn layers(mut self, layers: Vec<String>) -> Self {
    self.layers = Some(layers);
    self
  }

  /// 确保该层被捕获；未指定层时只捕获这一层
  pub fn ensure_layer(mut self, layer: &str) -> Self {
    let layers = self.layers.get_or_insert_with(Vec::new);
    if !layers.iter().any(|existing| existing == layer) {
      layers.push(layer.to_string());
    }
    self
  }

  pub fn descriptor(&self) -> &ModelDescriptor {
    &self.descriptor
  }

  pub fn build(self) -> Result<InferenceEngine, ModelError> {
    info!(
      "构建推理引擎: {} ({})",
      self.descriptor.name(),
      self.descriptor.weights()
    );
    let layers: Option<Vec<&str>> = self
      .layers
      .as_ref()
      .map(|layers| layers.iter().map(String::as_str).collect());
    InferenceEngine::new(self.descriptor, layers.as_deref())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  use super::*;

  /// 每层输出常数平面，数值等于调用次数
  struct StubBackbone {
    calls: Arc<AtomicUsize>,
    skip: Option<String>,
  }

  impl Backbone for StubBackbone {
    fn forward(&self, input: &InputTensor, capture: &mut CapturePoints) -> Result<(), ModelError> {
      assert_eq!(input.shape(), [1, 3, 224, 224]);
      let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      for spec in capture.layers().to_vec() {
        if self.skip.as_deref() == Some(spec.id.as_str()) {
          continue;
        }
        let data = vec![call as f32; spec.channels * 4];
        capture.record(ActivationTensor::new(
          spec.id.clone(),
          [1, spec.channels, 2, 2],
          data,
        )?);
      }
      Ok(())
    }
  }

  fn descriptor() -> ModelDescriptor {
    ModelDescriptor::custom(
      "stub",
      vec![
        LayerSpec::new("conv1", "c1", 2),
        LayerSpec::new("layer1", "l1", 3),
        LayerSpec::new("layer2", "l2", 4),
        LayerSpec::new("layer3", "l3", 4),
        LayerSpec::new("layer4", "l4", 4),
        LayerSpec::new("fc", "fc", 1),
      ],
    )
  }

  fn engine(active: Option<&[&str]>, skip: Option<&str>) -> InferenceEngine {
    let backbone = StubBackbone {
      calls: Arc::new(AtomicUsize::new(0)),
      skip: skip.map(str::to_string),
    };
    InferenceEngine::with_backbone(descriptor(), active, Box::new(backbone)).unwrap()
  }

  #[test]
  fn unsupported_model_name() {
    let err = ModelDescriptor::new("vgg16", "imagenet", None).unwrap_err();
    assert!(matches!(err, ModelError::UnsupportedModel(name) if name == "vgg16"));
  }

  #[test]
  fn default_layers_are_the_canonical_five() {
    let engine = engine(None, None);
    assert_eq!(
      engine.get_active_layers(),
      vec!["conv1", "layer1", "layer2", "layer3", "layer4"]
    );
    assert_eq!(engine.get_available_layers().len(), 6);
  }

  #[test]
  fn unknown_layer_fails_construction() {
    let backbone = StubBackbone {
      calls: Arc::new(AtomicUsize::new(0)),
      skip: None,
    };
    let err = InferenceEngine::with_backbone(descriptor(), Some(&["layer9"]), Box::new(backbone))
      .err()
      .unwrap();
    assert!(matches!(err, ModelError::UnknownLayer { layer, .. } if layer == "layer9"));
  }

  #[test]
  fn each_call_returns_fresh_activations() {
    let engine = engine(Some(&["conv1"]), None);
    let frame = Frame::filled(32, 24, [128, 128, 128]);
    let first = engine.infer(&frame).unwrap();
    let second = engine.infer(&frame).unwrap();
    assert_eq!(first.keys().collect::<Vec<_>>(), vec!["conv1"]);
    assert_eq!(first["conv1"].data()[0], 1.0);
    assert_eq!(second["conv1"].data()[0], 2.0);
  }

  #[test]
  fn missing_capture_is_inference_failure() {
    let engine = engine(Some(&["conv1", "layer1"]), Some("layer1"));
    let err = engine.infer(&Frame::filled(8, 8, [0, 0, 0])).unwrap_err();
    assert!(matches!(err, ModelError::InferenceFailure(_)));
  }

  #[test]
  fn capture_ignores_unrequested_layers() {
    let mut capture = CapturePoints::new(&[LayerSpec::new("a", "a", 1)]);
    capture.record(ActivationTensor::new("b", [1, 1, 1, 1], vec![0.0]).unwrap());
    capture.record(ActivationTensor::new("a", [1, 1, 1, 1], vec![0.0]).unwrap());
    let activations = capture.into_activations().unwrap();
    assert_eq!(activations.keys().collect::<Vec<_>>(), vec!["a"]);
  }

  #[test]
  fn malformed_activation_shapes() {
    assert!(ActivationTensor::new("x", [2, 1, 1, 1], vec![0.0; 2]).is_err());
    assert!(ActivationTensor::new("x", [1, 0, 1, 1], vec![]).is_err());
    assert!(ActivationTensor::new("x", [1, 2, 2, 2], vec![0.0; 7]).is_err());
    assert!(ActivationTensor::from_dyn_shape("x", &[1, 512], vec![0.0; 512]).is_err());
  }

  #[test]
  fn channel_planes() {
    let tensor = ActivationTensor::new("x", [1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    assert_eq!(tensor.channel(1), Some(&[3.0, 4.0][..]));
    assert_eq!(tensor.channel(2), None);
  }

  #[test]
  fn preprocess_normalizes_per_channel() {
    let input = preprocess(&Frame::filled(10, 10, [255, 0, 0]));
    let plane = 224 * 224;
    let red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
    let green = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
    assert!((input.data()[0] - red).abs() < 1e-5);
    assert!((input.data()[plane] - green).abs() < 1e-5);
  }

  #[test]
  fn builder_reads_url() {
    let url = Url::parse("resnet18:///models/r18.onnx?weights=imagenet&layers=conv1,layer2").unwrap();
    let builder = InferenceEngineBuilder::from_url(&url).unwrap();
    assert_eq!(builder.descriptor().name(), "resnet18");
    assert_eq!(
      builder.descriptor().path(),
      Some(&PathBuf::from("/models/r18.onnx"))
    );
    assert_eq!(
      builder.layers,
      Some(vec!["conv1".to_string(), "layer2".to_string()])
    );
  }

  #[test]
  fn builder_ensures_visualized_layer() {
    let url = Url::parse("resnet18:///r18.onnx").unwrap();
    let builder = InferenceEngineBuilder::from_url(&url)
      .unwrap()
      .ensure_layer("layer3")
      .ensure_layer("layer3");
    assert_eq!(builder.layers, Some(vec!["layer3".to_string()]));

    let url = Url::parse("resnet18:///r18.onnx?layers=conv1").unwrap();
    let builder = InferenceEngineBuilder::from_url(&url)
      .unwrap()
      .ensure_layer("layer3");
    assert_eq!(
      builder.layers,
      Some(vec!["conv1".to_string(), "layer3".to_string()])
    );
  }

  #[test]
  fn builder_rejects_unknown_model_scheme() {
    let url = Url::parse("vgg16:///models/vgg16.onnx").unwrap();
    assert!(matches!(
      InferenceEngineBuilder::from_url(&url),
      Err(ModelError::UnsupportedModel(_))
    ));
  }
}
