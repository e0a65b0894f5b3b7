// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/cameras.rs - 列出可用摄像头
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
use tracing::{info, warn};

use kanjian::input::{V4l2Opener, enumerate};

/// 探测 /dev/video0 起的摄像头
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 探测的设备编号上限
  #[arg(long, default_value_t = 10, value_name = "COUNT")]
  pub max_probe: u32,
  #[arg(long, default_value_t = 640)]
  pub width: u32,
  #[arg(long, default_value_t = 480)]
  pub height: u32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let opener = V4l2Opener::default().with_resolution(args.width, args.height);
  let devices = enumerate(&opener, args.max_probe);
  if devices.is_empty() {
    warn!("没有找到可用的摄像头");
  }
  for device in devices {
    info!("可用摄像头: /dev/video{}", device);
    println!("{}", device);
  }

  Ok(())
}
