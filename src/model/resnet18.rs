// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/resnet18.rs - ResNet-18 层注册表与加载
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

use crate::model::{Backbone, LayerSpec, ModelDescriptor, ModelError};

pub const NAME: &str = "resnet18";

const STAGE_CHANNELS: [usize; 4] = [64, 128, 256, 512];
const BLOCKS_PER_STAGE: usize = 2;

/// ResNet-18 可观察层
///
/// 节点名沿用 PyTorch 导出 ONNX 时的命名。导出时 BN 会被折叠进卷积，
/// 所以 `conv1` 与 `bn1` 指向同一个节点；残差块的输出是块内第二个 ReLU。
pub fn layer_registry() -> Vec<LayerSpec> {
  let mut layers = vec![
    LayerSpec::new("conv1", "/conv1/Conv_output_0", 64),
    LayerSpec::new("bn1", "/conv1/Conv_output_0", 64),
    LayerSpec::new("relu", "/relu/Relu_output_0", 64),
    LayerSpec::new("maxpool", "/maxpool/MaxPool_output_0", 64),
  ];

  for (stage, channels) in STAGE_CHANNELS.into_iter().enumerate() {
    let stage = format!("layer{}", stage + 1);
    let last = BLOCKS_PER_STAGE - 1;
    layers.push(LayerSpec::new(
      stage.clone(),
      format!("/{stage}/{stage}.{last}/relu_1/Relu_output_0"),
      channels,
    ));
    for block in 0..BLOCKS_PER_STAGE {
      let id = format!("{stage}.{block}");
      let node = format!("/{stage}/{id}/relu_1/Relu_output_0");
      layers.push(LayerSpec::new(id, node, channels));
    }
  }

  layers.push(LayerSpec::new(
    "avgpool",
    "/avgpool/GlobalAveragePool_output_0",
    512,
  ));
  layers
}

#[cfg(feature = "model_rten")]
pub fn load(
  descriptor: &ModelDescriptor,
  layers: &[LayerSpec],
) -> Result<Box<dyn Backbone>, ModelError> {
  let path = descriptor
    .path()
    .ok_or_else(|| ModelError::ModelLoad("未指定模型文件路径".to_string()))?;
  Ok(Box::new(rten_backbone::RtenBackbone::load(path, layers)?))
}

#[cfg(not(feature = "model_rten"))]
pub fn load(
  descriptor: &ModelDescriptor,
  _layers: &[LayerSpec],
) -> Result<Box<dyn Backbone>, ModelError> {
  tracing::error!("未启用 model_rten 特性，无法加载 {}", descriptor.name());
  Err(ModelError::UnsupportedModel(descriptor.name().to_string()))
}

#[cfg(feature = "model_rten")]
mod rten_backbone {
  use std::{path::Path, time::Instant};

  use rten::{Model, NodeId};
  use rten_tensor::{Tensor, prelude::*};
  use tracing::{debug, error, info};

  use crate::model::{ActivationTensor, Backbone, CapturePoints, InputTensor, LayerSpec, ModelError};

  /// rten 执行的 ResNet-18，一次运行同时取出所有请求层的中间节点
  pub struct RtenBackbone {
    model: Model,
    input: NodeId,
    nodes: Vec<(LayerSpec, NodeId)>,
  }

  impl RtenBackbone {
    pub fn load(path: &Path, layers: &[LayerSpec]) -> Result<Self, ModelError> {
      info!("加载模型文件: {}", path.display());
      let model =
        Model::load_file(path).map_err(|e| ModelError::ModelLoad(format!("{:?}", e)))?;

      let input = *model
        .input_ids()
        .first()
        .ok_or_else(|| ModelError::ModelLoad("模型没有输入".to_string()))?;

      let mut nodes = Vec::with_capacity(layers.len());
      for spec in layers {
        match model.find_node(&spec.node) {
          Some(id) => nodes.push((spec.clone(), id)),
          None => {
            error!("模型中找不到节点 {} (层 {})", spec.node, spec.id);
            return Err(ModelError::UnknownLayer {
              model: super::NAME.to_string(),
              layer: spec.id.clone(),
            });
          }
        }
      }
      info!("模型加载完成，采集 {} 个节点", nodes.len());

      Ok(Self {
        model,
        input,
        nodes,
      })
    }
  }

  impl Backbone for RtenBackbone {
    fn forward(&self, input: &InputTensor, capture: &mut CapturePoints) -> Result<(), ModelError> {
      let now = Instant::now();
      let tensor = Tensor::from_data(&input.shape()[..], input.data().to_vec());
      let wanted: Vec<&(LayerSpec, NodeId)> = self
        .nodes
        .iter()
        .filter(|(spec, _)| capture.wants(&spec.id))
        .collect();
      let ids: Vec<NodeId> = wanted.iter().map(|(_, id)| *id).collect();
      let (output_ids, slots) = super::unique_outputs(&ids);

      let outputs = self
        .model
        .run(vec![(self.input, tensor.view().into())], &output_ids, None)
        .map_err(|e| ModelError::InferenceFailure(format!("{:?}", e)))?;
      debug!("前向传播耗时: {:.2?}", now.elapsed());

      let tensors = outputs
        .into_iter()
        .map(|output| {
          Tensor::<f32>::try_from(output)
            .map_err(|e| ModelError::InferenceFailure(format!("节点输出类型错误: {:?}", e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

      // 共用节点的层（如 conv1 与 bn1）各自得到一份激活
      for ((spec, _), slot) in wanted.into_iter().zip(slots) {
        let tensor = &tensors[slot];
        capture.record(ActivationTensor::from_dyn_shape(
          spec.id.clone(),
          tensor.shape(),
          tensor.to_vec(),
        )?);
      }
      Ok(())
    }
  }
}

/// 去掉重复的输出节点，并给出每个请求在去重结果中的位置
#[cfg_attr(not(feature = "model_rten"), allow(dead_code))]
fn unique_outputs<T: Copy + PartialEq>(ids: &[T]) -> (Vec<T>, Vec<usize>) {
  let mut unique: Vec<T> = Vec::with_capacity(ids.len());
  let slots = ids
    .iter()
    .map(|id| match unique.iter().position(|u| u == id) {
      Some(slot) => slot,
      None => {
        unique.push(*id);
        unique.len() - 1
      }
    })
    .collect();
  (unique, slots)
}
