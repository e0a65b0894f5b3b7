// 该文件是 Kanjian （看见） 项目的一部分。
// src/output.rs - 输出定义
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
  convert::Infallible,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
};

use thiserror::Error;
use url::Url;

use crate::FromUrl;
#[cfg(any(
  feature = "save_image_file",
  feature = "directory_record",
  feature = "gstreamer_output"
))]
use crate::FromUrlWithScheme;
use crate::frame::{Fingerprint, Frame, RenderedImage};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

pub mod colormap;
pub mod visualizer;

pub use self::colormap::ColorMap;
pub use self::visualizer::{VisualizationError, Visualizer};

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[cfg(feature = "gstreamer_output")]
mod gstreamer_display;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_display::{GStreamerDisplayError, GStreamerDisplayOutput};

/// 一次流水线的产物
///
/// 图像与产生它的原始帧始终成对出现，`fingerprint` 是该帧的指纹。
#[derive(Debug, Clone)]
pub struct Rendered {
  pub layer: String,
  pub frame: Frame,
  pub fingerprint: Fingerprint,
  pub image: RenderedImage,
}

/// 只保留最新一张图的内存输出，供界面层轮询
#[derive(Debug, Clone, Default)]
pub struct LatestImage {
  slot: Arc<Mutex<Option<Rendered>>>,
  count: Arc<AtomicU64>,
}

impl LatestImage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self) -> Option<Rendered> {
    self
      .slot
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn take(&self) -> Option<Rendered> {
    self
      .slot
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
  }

  /// 累计收到的图像数量
  pub fn rendered_count(&self) -> u64 {
    self.count.load(Ordering::Acquire)
  }
}

impl Render<Frame, Rendered> for LatestImage {
  type Error = Infallible;

  fn render_result(&self, _frame: &Frame, result: &Rendered) -> Result<(), Self::Error> {
    *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
    self.count.fetch_add(1, Ordering::AcqRel);
    Ok(())
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer 显示输出错误: {0}")]
  GStreamerDisplayError(#[from] GStreamerDisplayError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 没有指定输出时展台使用的输出：有 GStreamer 时直接显示，否则按日期记录到目录
pub fn default_kiosk_output() -> Option<&'static str> {
  if cfg!(feature = "gstreamer_output") {
    Some("gst://autovideosink")
  } else if cfg!(feature = "directory_record") {
    Some("folder:///tmp/kanjian")
  } else {
    None
  }
}

pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
  #[cfg(feature = "gstreamer_output")]
  GStreamerDisplayOutput(GStreamerDisplayOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      #[cfg(feature = "gstreamer_output")]
      GStreamerDisplayOutput::SCHEME => {
        let output = GStreamerDisplayOutput::from_url(url)?;
        Ok(OutputWrapper::GStreamerDisplayOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl Render<Frame, Rendered> for OutputWrapper {
  type Error = OutputError;

  #[allow(unused_variables)]
  fn render_result(&self, frame: &Frame, result: &Rendered) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerDisplayOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rendered(frame: &Frame) -> Rendered {
    Rendered {
      layer: "layer1".to_string(),
      frame: frame.clone(),
      fingerprint: frame.fingerprint(),
      image: RenderedImage::new(4, 4),
    }
  }

  #[test]
  fn latest_image_keeps_only_newest() {
    let sink = LatestImage::new();
    let first = Frame::filled(4, 4, [0, 0, 0]);
    let second = Frame::filled(4, 4, [9, 9, 9]);
    sink.render_result(&first, &rendered(&first)).unwrap();
    sink.render_result(&second, &rendered(&second)).unwrap();

    assert_eq!(sink.rendered_count(), 2);
    let latest = sink.take().unwrap();
    assert_eq!(latest.fingerprint, second.fingerprint());
    assert!(sink.get().is_none());
  }

  #[cfg(any(feature = "gstreamer_output", feature = "directory_record"))]
  #[test]
  fn default_kiosk_output_is_built_in() {
    let url = Url::parse(default_kiosk_output().unwrap()).unwrap();
    #[cfg(feature = "gstreamer_output")]
    assert_eq!(url.scheme(), GStreamerDisplayOutput::SCHEME);
    #[cfg(not(feature = "gstreamer_output"))]
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Ok(OutputWrapper::DirectoryRecordOutput(_))
    ));
  }

  #[test]
  fn unknown_output_scheme() {
    let url = Url::parse("ftp://example.com/out.png").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch)
    ));
  }
}
