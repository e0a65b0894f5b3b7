// 该文件是 Kanjian （看见） 项目的一部分。
// src/config/migrations.rs - 配置版本迁移
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

//! 在原始 JSON 上逐级升级，只补充和改名，从不删除未知字段。

use serde_json::{Map, Value, json};
use tracing::{info, warn};

pub const CURRENT_VERSION: &str = "1.2";

const LEGACY_SELECTION_KEY: &str = "kivy_favorites";

/// 把任意旧版本升级到当前版本
pub fn migrate(mut raw: Value) -> Value {
  let Some(root) = raw.as_object_mut() else {
    return raw;
  };

  let mut version = root
    .get("version")
    .and_then(Value::as_str)
    .unwrap_or("1.0")
    .to_string();
  info!("配置版本: {}", version);

  if version == "1.0" {
    migrate_1_0_to_1_1(root);
    version = "1.1".to_string();
  }
  if version == "1.1" {
    migrate_1_1_to_1_2(root);
    version = "1.2".to_string();
  }
  if version != CURRENT_VERSION {
    warn!("未知的配置版本 {}，仍尝试加载", version);
  }
  raw
}

fn ui_mut(root: &mut Map<String, Value>) -> Option<&mut Map<String, Value>> {
  root
    .entry("ui")
    .or_insert_with(|| json!({}))
    .as_object_mut()
}

/// 1.0 → 1.1：补充全局文字和空的收藏选择
fn migrate_1_0_to_1_1(root: &mut Map<String, Value>) {
  info!("迁移配置 1.0 → 1.1");
  if let Some(ui) = ui_mut(root) {
    if ui.get("global_texts").is_none_or(Value::is_null) {
      let title = ui.get("title").and_then(Value::as_str).unwrap_or("Global");
      let texts = json!({
        "global_page_title": title,
        "home_button_label": "Home",
      });
      ui.insert("global_texts".to_string(), texts);
    }
    if ui.get(LEGACY_SELECTION_KEY).is_none_or(Value::is_null) {
      ui.insert(LEGACY_SELECTION_KEY.to_string(), json!({}));
    }
  }
  root.insert("version".to_string(), json!("1.1"));
}

/// 1.1 → 1.2：收藏选择改名为 `selected_favorites`，补充 `model_layers`
fn migrate_1_1_to_1_2(root: &mut Map<String, Value>) {
  info!("迁移配置 1.1 → 1.2");
  if let Some(ui) = ui_mut(root) {
    if let Some(legacy) = ui.remove(LEGACY_SELECTION_KEY) {
      merge_legacy_selection(ui, legacy);
    }
    if ui.get("model_layers").is_none_or(Value::is_null) {
      ui.insert("model_layers".to_string(), json!({}));
    }
  }
  root.insert("version".to_string(), json!("1.2"));
}

/// 旧的收藏选择并入 `selected_favorites`，已有的层以新键为准
fn merge_legacy_selection(ui: &mut Map<String, Value>, legacy: Value) {
  let legacy = match legacy {
    Value::Null => Map::new(),
    Value::Object(legacy) => legacy,
    other => {
      warn!("{} 不是对象，原样保留", LEGACY_SELECTION_KEY);
      ui.insert(LEGACY_SELECTION_KEY.to_string(), other);
      return;
    }
  };

  if ui
    .get("selected_favorites")
    .is_some_and(|selected| !selected.is_object() && !selected.is_null())
  {
    warn!("selected_favorites 不是对象，保留 {}", LEGACY_SELECTION_KEY);
    ui.insert(LEGACY_SELECTION_KEY.to_string(), Value::Object(legacy));
    return;
  }

  let selected = ui
    .entry("selected_favorites")
    .or_insert_with(|| json!({}));
  if selected.is_null() {
    *selected = json!({});
  }
  if let Some(selected) = selected.as_object_mut() {
    for (layer, names) in legacy {
      selected.entry(layer).or_insert(names);
    }
  }
}
