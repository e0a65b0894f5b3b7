// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/visualizer.rs - 激活可视化
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

//! 激活张量 → 彩色图像
//!
//! 流程分五步，每一步都是独立的函数：
//! 通道选择 → 归约 → 归一化 → 颜色映射 → 叠加原图。

use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};
use thiserror::Error;
use tracing::debug;

use crate::{
  config::{BlendMode, ChannelSelection, VizPreset},
  frame::{Frame, RenderedImage},
  model::{ActivationTensor, Activations},
  output::colormap::ColorMap,
};

/// top-k 最多选择的通道数
pub const MAX_TOP_K: usize = 10;

const NORMALIZE_EPSILON: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum VisualizationError {
  #[error("激活张量格式错误: {0}")]
  MalformedActivation(String),
  #[error("缺少层 {0} 的激活")]
  MissingActivation(String),
  #[error("叠加透明度 {0} 超出 [0, 1]")]
  InvalidAlpha(f32),
}

/// 把 k 限制在 `[1, min(10, C)]`
pub fn clamp_k(k: i64, channels: usize) -> usize {
  let upper = channels.min(MAX_TOP_K).max(1) as i64;
  k.clamp(1, upper) as usize
}

/// 单个通道的总体方差
fn variance(plane: &[f32]) -> f32 {
  let n = plane.len() as f32;
  let mean = plane.iter().sum::<f32>() / n;
  plane.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n
}

/// 第一步：通道选择
///
/// top-k 按方差降序取前 k 个（方差相同时编号小的优先），返回时按编号升序，
/// 这样归约结果与通道的排名顺序无关；显式列表中越界的编号被直接丢弃。
pub fn select_channels(activation: &ActivationTensor, selection: &ChannelSelection) -> Vec<usize> {
  let channels = activation.channels();
  match selection {
    ChannelSelection::TopK(k) => {
      let k = clamp_k(*k, channels);
      let mut ranked: Vec<(usize, f32)> = (0..channels)
        .filter_map(|c| activation.channel(c).map(|plane| (c, variance(plane))))
        .collect();
      ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
      let mut selected: Vec<usize> = ranked.into_iter().take(k).map(|(c, _)| c).collect();
      selected.sort_unstable();
      selected
    }
    ChannelSelection::Explicit(indices) => indices
      .iter()
      .filter(|&&i| i >= 0 && (i as usize) < channels)
      .map(|&i| i as usize)
      .collect(),
  }
}

/// 第二步：把选中的通道归约成一张二维图
pub fn reduce(activation: &ActivationTensor, selected: &[usize], mode: BlendMode) -> Vec<f32> {
  let plane = activation.height() * activation.width();
  let planes: Vec<&[f32]> = selected
    .iter()
    .filter_map(|&c| activation.channel(c))
    .collect();

  match planes.as_slice() {
    [] => vec![0.0; plane],
    [single] => single.to_vec(),
    planes => {
      let n = planes.len() as f32;
      let mut out = match mode {
        BlendMode::Max => vec![f32::NEG_INFINITY; plane],
        _ => vec![0.0; plane],
      };
      for channel in planes {
        for (acc, &v) in out.iter_mut().zip(channel.iter()) {
          match mode {
            BlendMode::Sum | BlendMode::Mean => *acc += v,
            BlendMode::Max => *acc = acc.max(v),
            // 目前各通道权重相同
            BlendMode::Weighted => *acc += v / n,
          }
        }
      }
      if mode == BlendMode::Mean {
        out.iter_mut().for_each(|v| *v /= n);
      }
      out
    }
  }
}

/// 第三步：平移到最小值为 0，缩放到 `[0, 255]`
pub fn normalize(map: &[f32]) -> Vec<u8> {
  let min = map.iter().copied().fold(f32::INFINITY, f32::min);
  let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  if !min.is_finite() || !max.is_finite() {
    return vec![0; map.len()];
  }
  let range = max - min;
  map
    .iter()
    .map(|&v| ((v - min) / (range + NORMALIZE_EPSILON) * 255.0).round().clamp(0.0, 255.0) as u8)
    .collect()
}

/// 第四步：颜色映射
pub fn colorize(gray: &[u8], width: u32, height: u32, cmap: ColorMap) -> RgbImage {
  let mut image = RgbImage::new(width, height);
  for (pixel, &value) in image.pixels_mut().zip(gray.iter()) {
    *pixel = Rgb(cmap.apply(value));
  }
  image
}

/// 第五步：原图缩放到热力图大小后按 alpha 混合
pub fn overlay(
  heatmap: &RgbImage,
  original: &Frame,
  alpha: f32,
  filter: FilterType,
) -> Result<RgbImage, VisualizationError> {
  if !(0.0..=1.0).contains(&alpha) {
    return Err(VisualizationError::InvalidAlpha(alpha));
  }
  let (width, height) = heatmap.dimensions();
  let resized = imageops::resize(&original.to_rgb_image(), width, height, filter);

  let mut blended = RgbImage::new(width, height);
  for ((out, o), h) in blended
    .pixels_mut()
    .zip(resized.pixels())
    .zip(heatmap.pixels())
  {
    for c in 0..3 {
      let value = o[c] as f32 * (1.0 - alpha) + h[c] as f32 * alpha;
      out[c] = value.round().clamp(0.0, 255.0) as u8;
    }
  }
  Ok(blended)
}

/// 可视化引擎
#[derive(Debug, Clone)]
pub struct Visualizer {
  filter: FilterType,
}

impl Default for Visualizer {
  fn default() -> Self {
    Self {
      filter: FilterType::Triangle,
    }
  }
}

impl Visualizer {
  /// 叠加时原图的重采样方式
  pub fn with_filter(mut self, filter: FilterType) -> Self {
    self.filter = filter;
    self
  }

  pub fn visualize(
    &self,
    activation: &ActivationTensor,
    preset: &VizPreset,
    original: Option<&Frame>,
  ) -> Result<RenderedImage, VisualizationError> {
    let width = u32::try_from(activation.width())
      .map_err(|_| VisualizationError::MalformedActivation(activation.layer().to_string()))?;
    let height = u32::try_from(activation.height())
      .map_err(|_| VisualizationError::MalformedActivation(activation.layer().to_string()))?;

    let selected = select_channels(activation, &preset.channels);
    debug!("层 {} 选中通道: {:?}", activation.layer(), selected);
    let reduced = reduce(activation, &selected, preset.blend_mode);
    let gray = normalize(&reduced);
    let heatmap = colorize(&gray, width, height, preset.cmap);

    match original {
      Some(original) if preset.overlay => overlay(&heatmap, original, preset.alpha, self.filter),
      _ => Ok(heatmap),
    }
  }

  /// 从一次推理结果中取出预设对应的层再可视化
  pub fn visualize_layer(
    &self,
    activations: &Activations,
    preset: &VizPreset,
    original: Option<&Frame>,
  ) -> Result<RenderedImage, VisualizationError> {
    let activation = activations
      .get(&preset.layer_id)
      .ok_or_else(|| VisualizationError::MissingActivation(preset.layer_id.clone()))?;
    self.visualize(activation, preset, original)
  }
}
