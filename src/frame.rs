// 该文件是 Kanjian （看见） 项目的一部分。
// src/frame.rs - RGB 帧定义
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

use std::{fmt, sync::Arc};

use image::RgbImage;
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

/// 可视化结果：8 位、H × W × 3 的 RGB 图像，返回后所有权归调用方
pub type RenderedImage = RgbImage;

pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("帧尺寸为空: {width}x{height}")]
  EmptyShape { width: u32, height: u32 },
}

/// 帧内容指纹（blake3），用于激活缓存
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // 前 8 字节足够在日志里区分
    for byte in &self.0[..8] {
      write!(f, "{:02x}", byte)?;
    }
    Ok(())
  }
}

/// 不可变的 RGB 帧（HWC 排列，每通道 8 位）
///
/// 像素数据放在 `Arc` 里，克隆只增加引用计数，
/// 因此帧可以在采集线程和工作线程之间廉价传递。
#[derive(Debug, Clone)]
pub struct RgbFrame {
  data: Arc<[u8]>,
  width: u32,
  height: u32,
}

pub type Frame = RgbFrame;

impl RgbFrame {
  pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::EmptyShape { width, height });
    }
    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into(),
      width,
      height,
    })
  }

  /// 纯色帧，主要用于测试和占位
  pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
    let pixels = width as usize * height as usize;
    let data: Vec<u8> = rgb.iter().copied().cycle().take(pixels * RGB_CHANNELS).collect();
    Self {
      data: data.into(),
      width,
      height,
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn fingerprint(&self) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&self.width.to_le_bytes());
    hasher.update(&self.height.to_le_bytes());
    hasher.update(&self.data);
    Fingerprint(*hasher.finalize().as_bytes())
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    // 长度在构造时已校验
    RgbImage::from_raw(self.width, self.height, self.data.to_vec())
      .unwrap_or_else(|| RgbImage::new(self.width, self.height))
  }
}

impl AsNhwcFrame for RgbFrame {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

impl From<RgbImage> for RgbFrame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw().into(),
      width,
      height,
    }
  }
}
