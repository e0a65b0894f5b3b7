// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use chrono::{Datelike, Utc};
use image::{RgbImage, imageops};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  output::{Render, Rendered},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 按日期目录记录每一张可视化结果
///
/// 文件路径为 `dir/YYYY/MM/DD/HH-MM-SS-XXXX.png`，`XXXX` 是十六进制帧计数。
/// 带 `original` 参数时左边拼上缩放到同尺寸的原始帧。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: Mutex<u16>,
  with_original: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let with_original = uri.query_pairs().any(|(k, _)| k == "original");

    Ok(DirectoryRecordOutput::new(uri.path(), with_original))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl Into<PathBuf>, with_original: bool) -> Self {
    Self {
      directory: directory.into(),
      frame_counter: Mutex::new(0),
      with_original,
    }
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_id(&self) -> u16 {
    let mut counter = self
      .frame_counter
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    *counter = counter.wrapping_add(1);
    *counter
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

/// 原图在左、热力图在右
fn side_by_side(original: &Frame, heatmap: &RgbImage) -> RgbImage {
  let (width, height) = heatmap.dimensions();
  let original = imageops::resize(
    &original.to_rgb_image(),
    width,
    height,
    imageops::FilterType::Triangle,
  );
  let mut canvas = RgbImage::new(width * 2, height);
  imageops::replace(&mut canvas, &original, 0, 0);
  imageops::replace(&mut canvas, heatmap, i64::from(width), 0);
  canvas
}

impl Render<Frame, Rendered> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &Frame, result: &Rendered) -> Result<(), Self::Error> {
    let path = self.frame_path()?;
    if self.with_original {
      side_by_side(frame, &result.image).save(&path)?;
    } else {
      result.image.save(&path)?;
    }
    debug!("记录层 {} 的可视化: {}", result.layer, path.display());
    Ok(())
  }
}
