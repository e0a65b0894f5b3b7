// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/kiosk.rs - 展台模式
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

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;
use url::Url;

use kanjian::{
  FromUrl,
  config::{MAX_FAVORITES, SettingsStore},
  input::V4l2Opener,
  model::{InferenceEngine, InferenceEngineBuilder, ModelDescriptor},
  output::{OutputWrapper, default_kiosk_output},
  task::{KioskTask, Pipeline, Task},
};

/// 按展项配置显示某一层或某个收藏的实时可视化
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 展项配置文件
  #[arg(long, value_name = "FILE", default_value = "exhibit.json")]
  pub settings: PathBuf,
  /// 模型，不指定时使用配置中的模型
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 界面层，不指定时使用顺序最靠前的层
  #[arg(long, value_name = "UI_LAYER")]
  pub ui_layer: Option<String>,
  /// 显示的收藏名称
  #[arg(long, value_name = "NAME")]
  pub favorite: Option<String>,
  /// 保存该层选中的收藏（逗号分隔，最多 3 个）
  #[arg(long, value_name = "NAMES", value_delimiter = ',')]
  pub select: Option<Vec<String>>,
  /// 只列出收藏
  #[arg(long)]
  pub list: bool,
  /// 摄像头编号，不指定时使用第一个可用的
  #[arg(long, value_name = "DEVICE")]
  pub device: Option<u32>,
  #[arg(long, default_value_t = 30)]
  pub fps: u32,
  /// 输出，默认 gst://autovideosink（无 GStreamer 时记录到 /tmp/kanjian）
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let store = SettingsStore::new(&args.settings);
  let mut settings = store.load();
  info!("展项: {} ({})", settings.exhibit_id, settings.ui.global_texts.global_page_title);

  let ui_layer = match &args.ui_layer {
    Some(id) => settings
      .ui_layer(id)
      .ok_or_else(|| anyhow!("配置中没有界面层 {}", id))?,
    None => settings
      .ui
      .layers
      .iter()
      .min_by_key(|layer| layer.order)
      .ok_or_else(|| anyhow!("配置中没有界面层"))?,
  };
  let preset = settings
    .preset(&ui_layer.viz_preset_id)
    .cloned()
    .with_context(|| format!("界面层 {} 引用的预设不存在", ui_layer.id))?;
  info!("界面层: {} - {}", ui_layer.id, ui_layer.title_bar_label);

  let model_layer = preset.layer_id.clone();
  let content = settings.model_layer_content(&model_layer);
  info!("模型层: {} - {}", model_layer, content.title);

  if let Some(names) = &args.select {
    settings.set_selected_favorites(&model_layer, names);
    store.save(&settings)?;
    info!("已保存层 {} 的收藏选择", model_layer);
  }

  if args.list {
    let selected: Vec<String> = settings
      .selected_favorites(&model_layer)
      .into_iter()
      .map(|favorite| favorite.name)
      .collect();
    for favorite in settings.favorites_for_model_layer(&model_layer) {
      let mark = if selected.contains(&favorite.name) { "*" } else { " " };
      println!("{} {}", mark, favorite.name);
    }
    println!("(最多选择 {} 个)", MAX_FAVORITES);
    return Ok(());
  }

  let favorite = match &args.favorite {
    Some(name) => {
      let favorite = settings
        .favorites_for_model_layer(&model_layer)
        .into_iter()
        .find(|favorite| &favorite.name == name)
        .ok_or_else(|| anyhow!("层 {} 没有收藏 {}", model_layer, name))?;
      info!("使用收藏: {}", favorite.name);
      Some(favorite)
    }
    None => None,
  };

  let engine = match &args.model {
    Some(url) => InferenceEngineBuilder::from_url(url)?
      .ensure_layer(&preset.layer_id)
      .build()?,
    None => {
      let descriptor = ModelDescriptor::from_config(&settings.model)?;
      InferenceEngine::new(descriptor, Some(&[preset.layer_id.as_str()]))?
    }
  };
  let pipeline = Pipeline::new(engine, preset)?;

  let output_url = match args.output {
    Some(url) => url,
    None => {
      let default = default_kiosk_output()
        .ok_or_else(|| anyhow!("没有编译可用的默认输出，请指定 --output"))?;
      Url::parse(default)?
    }
  };
  info!("输出: {}", output_url);
  let output = OutputWrapper::from_url(&output_url)?;

  let interval = Duration::from_secs_f64(1.0 / f64::from(args.fps.max(1)));
  KioskTask::default()
    .with_device(args.device)
    .with_favorite(favorite)
    .with_interval(interval)
    .run_task(V4l2Opener::default(), pipeline, output)
}
