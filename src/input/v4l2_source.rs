// 该文件是 Kanjian （看见） 项目的一部分。
// src/input/v4l2_source.rs - V4L2 摄像头输入源
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

use std::time::Instant;

use tracing::{debug, error, info};
use url::Url;
use v4l::{
  Device, FourCC, buffer::Type, io::mmap::Stream, io::traits::CaptureStream, video::Capture,
};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{CaptureError, DeviceId, DeviceOpener, FrameSource},
};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const BUFFER_COUNT: u32 = 4;
const YUYV: &[u8; 4] = b"YUYV";

/// V4L2 摄像头工厂，保存期望的采集分辨率
#[derive(Debug, Clone)]
pub struct V4l2Opener {
  width: u32,
  height: u32,
  buffers: u32,
}

impl Default for V4l2Opener {
  fn default() -> Self {
    Self {
      width: DEFAULT_WIDTH,
      height: DEFAULT_HEIGHT,
      buffers: BUFFER_COUNT,
    }
  }
}

impl V4l2Opener {
  pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
    self.width = width;
    self.height = height;
    self
  }

  /// 解析 `v4l:///dev/video2`、`v4l://2` 或 `v4l://` 形式的 URL，返回工厂和设备编号
  pub fn from_url_with_device(url: &Url) -> Result<(Self, DeviceId), CaptureError> {
    let opener = Self::from_url(url)?;

    let device = if let Some(index) = url.path().strip_prefix("/dev/video") {
      index.parse().ok()
    } else {
      url.host_str().and_then(|host| host.parse().ok())
    };

    Ok((opener, device.unwrap_or(0)))
  }
}

impl FromUrlWithScheme for V4l2Opener {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4l2Opener {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(CaptureError::SchemeMismatch);
    }

    let mut opener = Self::default();
    for (key, value) in url.query_pairs() {
      match &*key {
        "width" => opener.width = value.parse().unwrap_or(opener.width),
        "height" => opener.height = value.parse().unwrap_or(opener.height),
        "buffers" => opener.buffers = value.parse().unwrap_or(opener.buffers).max(1),
        _ => debug!("忽略未知参数: {}={}", key, value),
      }
    }
    Ok(opener)
  }
}

impl DeviceOpener for V4l2Opener {
  type Source = V4l2Camera;

  fn open(&self, device: DeviceId) -> Result<Self::Source, CaptureError> {
    V4l2Camera::open(device, self)
  }
}

/// 已打开的 V4L2 摄像头
///
/// 采集流持有设备句柄的引用计数，关闭时先释放流再释放设备。
pub struct V4l2Camera {
  device_id: DeviceId,
  device: Option<Device>,
  stream: Option<Stream<'static>>,
  width: u32,
  height: u32,
  frame_index: u64,
  opened_at: Instant,
}

impl V4l2Camera {
  fn open(device_id: DeviceId, opener: &V4l2Opener) -> Result<Self, CaptureError> {
    let device =
      Device::new(device_id as usize).map_err(|e| CaptureError::unavailable(device_id, e))?;

    // 设置视频格式
    let mut format = device
      .format()
      .map_err(|e| CaptureError::unavailable(device_id, e))?;
    format.width = opener.width;
    format.height = opener.height;
    format.fourcc = FourCC::new(YUYV);
    let format = device
      .set_format(&format)
      .map_err(|e| CaptureError::unavailable(device_id, e))?;

    if format.fourcc != FourCC::new(YUYV) {
      return Err(CaptureError::unavailable(
        device_id,
        format!("不支持的像素格式: {}", format.fourcc),
      ));
    }

    let stream = Stream::with_buffers(&device, Type::VideoCapture, opener.buffers)
      .map_err(|e| CaptureError::unavailable(device_id, format!("无法创建捕获流: {}", e)))?;

    info!(
      "摄像头 {} 已打开: {}x{} YUYV",
      device_id, format.width, format.height
    );

    Ok(Self {
      device_id,
      device: Some(device),
      stream: Some(stream),
      width: format.width,
      height: format.height,
      frame_index: 0,
      opened_at: Instant::now(),
    })
  }

  pub fn device_id(&self) -> DeviceId {
    self.device_id
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }
}

impl FrameSource for V4l2Camera {
  fn read(&mut self) -> Result<Frame, CaptureError> {
    let device = self.device_id;
    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| CaptureError::read_failure(device, "摄像头未打开"))?;

    let (buffer, meta) = stream
      .next()
      .map_err(|e| CaptureError::read_failure(device, e))?;

    let expected = (self.width * self.height * 2) as usize;
    let used = match meta.bytesused as usize {
      0 => buffer.len(),
      n => n.min(buffer.len()),
    };
    if used < expected {
      return Err(CaptureError::read_failure(
        device,
        format!("帧数据不完整: {} < {}", used, expected),
      ));
    }

    let rgb = yuyv_to_rgb(&buffer[..expected]);
    self.frame_index += 1;
    debug!(
      "摄像头 {} 第 {} 帧 ({}ms)",
      device,
      self.frame_index,
      self.opened_at.elapsed().as_millis()
    );

    Frame::from_rgb(self.width, self.height, rgb).map_err(|e| CaptureError::read_failure(device, e))
  }

  fn close(&mut self) {
    // 确保 stream 在 device 之前被 drop
    let had_stream = self.stream.take().is_some();
    let had_device = self.device.take().is_some();
    if had_stream || had_device {
      info!(
        "摄像头 {} 已释放，共读取 {} 帧",
        self.device_id, self.frame_index
      );
    }
  }

  fn is_open(&self) -> bool {
    self.stream.is_some()
  }
}

impl Drop for V4l2Camera {
  fn drop(&mut self) {
    self.close();
  }
}

/// 将 YUYV 格式转换为 RGB
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
  let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);

  for chunk in yuyv.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn neutral_chroma_is_gray() {
    let rgb = yuyv_to_rgb(&[100, 128, 200, 128]);
    assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
  }

  #[test]
  fn strong_v_pushes_red() {
    let rgb = yuyv_to_rgb(&[128, 128, 128, 255]);
    assert_eq!(rgb[0], 255);
    assert!(rgb[1] < 128);
  }

  #[test]
  fn parses_device_from_path_and_host() {
    let (_, device) =
      V4l2Opener::from_url_with_device(&Url::parse("v4l:///dev/video2").unwrap()).unwrap();
    assert_eq!(device, 2);
    let (opener, device) =
      V4l2Opener::from_url_with_device(&Url::parse("v4l://3?width=320&height=240").unwrap())
        .unwrap();
    assert_eq!(device, 3);
    assert_eq!((opener.width, opener.height), (320, 240));
  }

  #[test]
  fn rejects_foreign_scheme() {
    let err = V4l2Opener::from_url(&Url::parse("image:///tmp/a.png").unwrap()).unwrap_err();
    assert!(matches!(err, CaptureError::SchemeMismatch));
  }
}
