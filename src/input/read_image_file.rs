// 该文件是 Kanjian （看见） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::Path;

use image::ImageReader;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{CaptureError, FrameSource},
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 静态图像输入：每次 `read` 返回同一帧，可以当作一个不会掉线的摄像头
pub struct ImageFileInput {
  frame: Frame,
  open: bool,
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    let image = ImageReader::open(path)?.decode()?;
    let frame = Frame::from(image.to_rgb8());
    info!(
      "读取图像 {}: {}x{}",
      path.display(),
      frame.width(),
      frame.height()
    );
    Ok(Self::from_frame(frame))
  }

  pub fn from_frame(frame: Frame) -> Self {
    Self { frame, open: true }
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    Self::open(url.path())
  }
}

impl FrameSource for ImageFileInput {
  fn read(&mut self) -> Result<Frame, CaptureError> {
    if !self.open {
      return Err(CaptureError::read_failure(0, "图像输入已关闭"));
    }
    Ok(self.frame.clone())
  }

  fn close(&mut self) {
    self.open = false;
  }

  fn is_open(&self) -> bool {
    self.open
  }
}

#[cfg(test)]
mod tests {
  use image::{Rgb, RgbImage};

  use super::*;

  #[test]
  fn reads_png_and_repeats_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("still.png");
    let mut image = RgbImage::new(5, 3);
    image.put_pixel(4, 2, Rgb([9, 8, 7]));
    image.save(&path).unwrap();

    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    let first = input.read().unwrap();
    let second = input.read().unwrap();
    assert_eq!((first.width(), first.height()), (5, 3));
    assert_eq!(first.fingerprint(), second.fingerprint());
  }

  #[test]
  fn closed_input_refuses_reads() {
    let mut input = ImageFileInput::from_frame(Frame::filled(2, 2, [0, 0, 0]));
    input.close();
    input.close();
    assert!(!input.is_open());
    assert!(matches!(
      input.read(),
      Err(CaptureError::ReadFailure { .. })
    ));
  }

  #[test]
  fn missing_file_is_io_error() {
    let url = Url::parse("image:///definitely/not/here.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::IoError(_))
    ));
  }
}
