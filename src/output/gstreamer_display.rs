// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/gstreamer_display.rs - GStreamer 实时显示输出
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

//! # GStreamer 实时显示
//!
//! 把可视化结果推入 `appsrc`，交给显示 sink 播放。
//!
//! ## URL Scheme
//!
//! `gst://<sink>?fps=30`
//!
//! - `sink`: 显示元素，默认 `autovideosink`
//! - `fps`: 标称帧率，用于时间戳，默认 30
//!
//! ```no_run
//! use kanjian::{FromUrl, output::GStreamerDisplayOutput};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://autovideosink?fps=30")?;
//! let output = GStreamerDisplayOutput::from_url(&url)?;
//! # Ok(())
//! # }
//! ```
//!
//! 可视化图像的尺寸随层变化，caps 按收到的第一张图协商，尺寸变化时重新设置。

use std::sync::{Mutex, PoisonError};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  output::{Render, Rendered},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

/// GStreamer 显示输出错误类型
#[derive(Error, Debug)]
pub enum GStreamerDisplayError {
  /// URI scheme 不匹配
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// 无法获取 appsrc 元素
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  /// 无法转换元素为 appsrc
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  /// 缓冲区创建错误
  #[error("Buffer creation error")]
  BufferCreationError,
}

struct StreamState {
  size: Option<(u32, u32)>,
  frame_count: u64,
}

pub struct GStreamerDisplayOutput {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  fps: i32,
  state: Mutex<StreamState>,
}

impl FromUrlWithScheme for GStreamerDisplayOutput {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerDisplayOutput {
  type Error = GStreamerDisplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(GStreamerDisplayError::SchemeMismatch);
    }

    gst::init()?;

    let query_pairs: std::collections::HashMap<_, _> = url.query_pairs().collect();
    let fps: i32 = query_pairs
      .get("fps")
      .and_then(|v| v.parse().ok())
      .filter(|fps| *fps > 0)
      .unwrap_or(30);
    let sink = url
      .host_str()
      .filter(|host| !host.is_empty())
      .unwrap_or("autovideosink");

    let pipeline_desc = format!(
      "appsrc name=src is-live=true do-timestamp=false ! videoconvert ! videoscale ! {} sync=false",
      sink
    );
    info!("创建显示管道: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerDisplayError::PipelineError("无法创建管道".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerDisplayError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerDisplayError::AppSrcConversionFailed)?;
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerDisplayOutput {
      pipeline,
      appsrc,
      fps,
      state: Mutex::new(StreamState {
        size: None,
        frame_count: 0,
      }),
    })
  }
}

impl Drop for GStreamerDisplayOutput {
  fn drop(&mut self) {
    let _ = self.appsrc.end_of_stream();

    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止显示管道失败: {}", e);
    }

    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    info!("显示输出关闭，共显示 {} 帧", state.frame_count);
  }
}

impl GStreamerDisplayOutput {
  fn set_caps(&self, width: u32, height: u32) {
    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", width as i32)
      .field("height", height as i32)
      .field("framerate", gst::Fraction::new(self.fps, 1))
      .build();
    self.appsrc.set_caps(Some(&caps));
    info!("显示尺寸: {}x{} @ {} fps", width, height, self.fps);
  }

  fn push_image(&self, image: &image::RgbImage) -> Result<(), GStreamerDisplayError> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    let size = image.dimensions();
    if state.size != Some(size) {
      self.set_caps(size.0, size.1);
      state.size = Some(size);
    }

    let data = image.as_raw();
    let mut buffer =
      gst::Buffer::with_size(data.len()).map_err(|_| GStreamerDisplayError::BufferCreationError)?;
    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerDisplayError::BufferCreationError)?;
      let frame_duration = 1_000_000_000 / self.fps as u64;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(
        state.frame_count * frame_duration,
      ));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_duration));
      let mut buffer_map = buffer_ref
        .map_writable()
        .map_err(|_| GStreamerDisplayError::PipelineError("无法映射缓冲区".to_string()))?;
      buffer_map.copy_from_slice(data);
    }
    state.frame_count += 1;

    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| GStreamerDisplayError::PipelineError(format!("推送缓冲区失败: {:?}", e)))?;

    Ok(())
  }
}

impl Render<Frame, Rendered> for GStreamerDisplayOutput {
  type Error = GStreamerDisplayError;

  fn render_result(&self, _frame: &Frame, result: &Rendered) -> Result<(), Self::Error> {
    self.push_image(&result.image)
  }
}
