// 该文件是 Kanjian （看见） 项目的一部分。
// src/input.rs - 摄像头/图像输入
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

use std::{thread, time::Duration};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{FromUrl, frame::Frame};

/// 摄像头编号（/dev/videoN 中的 N）
pub type DeviceId = u32;

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("摄像头 {device} 不可用: {reason}")]
  DeviceUnavailable { device: DeviceId, reason: String },
  #[error("摄像头 {device} 读取失败: {reason}")]
  ReadFailure { device: DeviceId, reason: String },
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
}

impl CaptureError {
  pub fn unavailable(device: DeviceId, reason: impl ToString) -> Self {
    CaptureError::DeviceUnavailable {
      device,
      reason: reason.to_string(),
    }
  }

  pub fn read_failure(device: DeviceId, reason: impl ToString) -> Self {
    CaptureError::ReadFailure {
      device,
      reason: reason.to_string(),
    }
  }
}

/// 已打开的帧来源
///
/// `read` 失败后句柄保持打开，由调用方决定重试还是关闭；
/// `close` 可重复调用。
pub trait FrameSource: Send {
  fn read(&mut self) -> Result<Frame, CaptureError>;
  fn close(&mut self);
  fn is_open(&self) -> bool;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn read(&mut self) -> Result<Frame, CaptureError> {
    (**self).read()
  }

  fn close(&mut self) {
    (**self).close()
  }

  fn is_open(&self) -> bool {
    (**self).is_open()
  }
}

/// 按编号打开设备的工厂
pub trait DeviceOpener {
  type Source: FrameSource;

  fn open(&self, device: DeviceId) -> Result<Self::Source, CaptureError>;
}

/// 探测 `0..max_probe` 范围内可以打开的设备，每个设备探测后立即释放
pub fn enumerate<O: DeviceOpener>(opener: &O, max_probe: u32) -> Vec<DeviceId> {
  let mut found = Vec::new();
  for device in 0..max_probe {
    match opener.open(device) {
      Ok(mut source) => {
        source.close();
        found.push(device);
      }
      Err(e) => debug!("探测摄像头 {} 失败: {}", device, e),
    }
  }
  info!("共探测到 {} 个可用摄像头: {:?}", found.len(), found);
  found
}

/// 单次快照：打开、读取一帧、释放
///
/// 打开步骤受 `timeout` 限制；无论读取是否成功，设备都会被释放。
pub fn snapshot<O>(opener: &O, device: DeviceId, timeout: Duration) -> Result<Frame, CaptureError>
where
  O: DeviceOpener + Clone + Send + 'static,
  O::Source: 'static,
{
  let (tx, rx) = crossbeam_channel::bounded(1);
  let worker = opener.clone();
  thread::spawn(move || {
    // 超时后接收端已经丢弃，迟到的句柄随发送失败一起被 drop
    let _ = tx.send(worker.open(device));
  });

  let mut source = match rx.recv_timeout(timeout) {
    Ok(result) => result?,
    Err(_) => {
      error!("打开摄像头 {} 超时 ({:?})", device, timeout);
      return Err(CaptureError::unavailable(
        device,
        format!("打开超时 ({:?})", timeout),
      ));
    }
  };

  let frame = source.read();
  source.close();
  frame
}

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

mod v4l2_source;
pub use self::v4l2_source::{V4l2Camera, V4l2Opener};

/// 根据 URL 选择的输入源
pub enum InputWrapper {
  V4l2(V4l2Camera),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = CaptureError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    if url.scheme() == V4l2Opener::SCHEME {
      let (opener, device) = V4l2Opener::from_url_with_device(url)?;
      return Ok(InputWrapper::V4l2(opener.open(device)?));
    }
    #[cfg(feature = "read_image_file")]
    {
      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    Err(CaptureError::SchemeMismatch)
  }
}

impl FrameSource for InputWrapper {
  fn read(&mut self) -> Result<Frame, CaptureError> {
    match self {
      InputWrapper::V4l2(input) => input.read(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.read(),
    }
  }

  fn close(&mut self) {
    match self {
      InputWrapper::V4l2(input) => input.close(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.close(),
    }
  }

  fn is_open(&self) -> bool {
    match self {
      InputWrapper::V4l2(input) => input.is_open(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.is_open(),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  use super::*;
  use crate::frame::AsNhwcFrame;

  #[derive(Clone, Default)]
  struct CountingOpener {
    present: Vec<DeviceId>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    delay: Duration,
    fail_read: bool,
  }

  struct CountingSource {
    device: DeviceId,
    open: bool,
    closed: Arc<AtomicUsize>,
    fail_read: bool,
  }

  impl FrameSource for CountingSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
      if self.fail_read {
        return Err(CaptureError::read_failure(self.device, "no signal"));
      }
      Ok(Frame::filled(4, 4, [self.device as u8, 0, 0]))
    }

    fn close(&mut self) {
      if self.open {
        self.open = false;
        self.closed.fetch_add(1, Ordering::SeqCst);
      }
    }

    fn is_open(&self) -> bool {
      self.open
    }
  }

  impl DeviceOpener for CountingOpener {
    type Source = CountingSource;

    fn open(&self, device: DeviceId) -> Result<Self::Source, CaptureError> {
      thread::sleep(self.delay);
      if !self.present.contains(&device) {
        return Err(CaptureError::unavailable(device, "not present"));
      }
      self.opened.fetch_add(1, Ordering::SeqCst);
      Ok(CountingSource {
        device,
        open: true,
        closed: self.closed.clone(),
        fail_read: self.fail_read,
      })
    }
  }

  #[test]
  fn enumerate_releases_every_probe() {
    let opener = CountingOpener {
      present: vec![0, 2],
      ..Default::default()
    };
    assert_eq!(enumerate(&opener, 5), vec![0, 2]);
    assert_eq!(opener.opened.load(Ordering::SeqCst), 2);
    assert_eq!(opener.closed.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn enumerate_respects_probe_limit() {
    let opener = CountingOpener {
      present: vec![3],
      ..Default::default()
    };
    assert!(enumerate(&opener, 3).is_empty());
  }

  #[test]
  fn snapshot_reads_once_and_releases() {
    let opener = CountingOpener {
      present: vec![1],
      ..Default::default()
    };
    let frame = snapshot(&opener, 1, Duration::from_secs(5)).unwrap();
    assert_eq!(&frame.as_nhwc()[..3], &[1, 0, 0]);
    assert_eq!(opener.closed.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn snapshot_releases_after_read_failure() {
    let opener = CountingOpener {
      present: vec![0],
      fail_read: true,
      ..Default::default()
    };
    let err = snapshot(&opener, 0, Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, CaptureError::ReadFailure { device: 0, .. }));
    assert_eq!(opener.closed.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn snapshot_open_timeout_is_device_unavailable() {
    let opener = CountingOpener {
      present: vec![0],
      delay: Duration::from_millis(300),
      ..Default::default()
    };
    let err = snapshot(&opener, 0, Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, CaptureError::DeviceUnavailable { device: 0, .. }));
  }

  #[test]
  fn snapshot_missing_device() {
    let opener = CountingOpener::default();
    let err = snapshot(&opener, 4, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, CaptureError::DeviceUnavailable { device: 4, .. }));
  }
}
