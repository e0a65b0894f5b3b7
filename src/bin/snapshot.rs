// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/snapshot.rs - 单次快照可视化
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

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use kanjian::{
  FromUrl, FromUrlWithScheme,
  config::VizPreset,
  input::{InputWrapper, V4l2Opener, snapshot},
  model::InferenceEngineBuilder,
  output::{OutputWrapper, Render},
  task::{OneShotTask, Pipeline, Task},
};

/// 拍一张照片，输出指定层的可视化
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 resnet18:///models/resnet18.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 v4l:///dev/video0 或 image:///still.png
  #[arg(long, value_name = "SOURCE", default_value = "v4l:///dev/video0")]
  pub input: Url,
  /// 可视化预设，例如 viz://layer2?channels=topk&k=3&cmap=magma
  #[arg(long, value_name = "PRESET", default_value = "viz://layer1")]
  pub preset: Url,
  /// 输出，例如 image:///tmp/snapshot.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 打开摄像头的超时（毫秒）
  #[arg(long, default_value_t = 5000, value_name = "MILLIS")]
  pub timeout_ms: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("预设: {}", args.preset);
  info!("输出路径: {}", args.output);

  let preset = VizPreset::from_url(&args.preset)?;
  let engine = InferenceEngineBuilder::from_url(&args.model)?
    .ensure_layer(&preset.layer_id)
    .build()?;
  let mut pipeline = Pipeline::new(engine, preset)?;
  let output = OutputWrapper::from_url(&args.output)?;

  if args.input.scheme() == V4l2Opener::SCHEME {
    let (opener, device) = V4l2Opener::from_url_with_device(&args.input)?;
    let frame = snapshot(&opener, device, Duration::from_millis(args.timeout_ms))?;
    info!("快照完成: {}x{}", frame.width(), frame.height());
    let rendered = pipeline.process(&frame)?;
    output.render_result(&frame, &rendered)?;
    return Ok(());
  }

  let input = InputWrapper::from_url(&args.input)?;
  OneShotTask.run_task(input, pipeline, output)
}
