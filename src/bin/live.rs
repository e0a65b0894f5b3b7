// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/live.rs - 连续实时可视化
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use kanjian::{
  FromUrl,
  config::VizPreset,
  input::InputWrapper,
  model::InferenceEngineBuilder,
  output::OutputWrapper,
  task::{LiveTask, Pipeline, SlotPolicy, Task},
};

/// 摄像头连续采集，后台线程推理和可视化
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 resnet18:///models/resnet18.onnx?layers=layer2
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE", default_value = "v4l:///dev/video0")]
  pub input: Url,
  /// 可视化预设
  #[arg(long, value_name = "PRESET", default_value = "viz://layer1")]
  pub preset: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 处理的帧数，0 表示不限
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: usize,
  /// 帧槽已满时丢弃新帧而不是替换旧帧
  #[arg(long)]
  pub drop_incoming: bool,
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
  let pipeline = Pipeline::new(engine, preset)?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let policy = if args.drop_incoming {
    SlotPolicy::DropIncoming
  } else {
    SlotPolicy::KeepLatest
  };
  let frame_number = (args.frame_number > 0).then_some(args.frame_number);

  LiveTask::default()
    .with_policy(policy)
    .with_frame_number(frame_number)
    .run_task(input, pipeline, output)
}
