// 该文件是 Kanjian （看见） 项目的一部分。
// src/config.rs - 展项配置、可视化预设与收藏
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

use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, output::ColorMap};

pub mod migrations;
pub mod store;

pub use self::store::SettingsStore;

/// 每个模型层最多选中的收藏数
pub const MAX_FAVORITES: usize = 3;
/// top-k 未给出 k 时的默认值
pub const DEFAULT_TOP_K: i64 = 3;
const DEFAULT_ALPHA: f32 = 0.6;
const DEFAULT_FAVORITE_ALPHA: f32 = 0.5;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("等待配置文件锁超时 ({0:?})")]
  LockTimeout(Duration),
  #[error("模型层 {model_layer_id} 已存在名为 {name} 的收藏")]
  DuplicateFavorite { model_layer_id: String, name: String },
  #[error("未知的界面层: {0}")]
  UnknownLayer(String),
  #[error("无效的可视化预设: {0}")]
  InvalidPreset(String),
}

/// 多通道归约方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
  Sum,
  #[default]
  Mean,
  Max,
  /// 加权平均，目前各通道权重相同
  Weighted,
}

impl BlendMode {
  pub const ALL: [BlendMode; 4] = [
    BlendMode::Sum,
    BlendMode::Mean,
    BlendMode::Max,
    BlendMode::Weighted,
  ];

  pub fn name(self) -> &'static str {
    match self {
      BlendMode::Sum => "sum",
      BlendMode::Mean => "mean",
      BlendMode::Max => "max",
      BlendMode::Weighted => "weighted",
    }
  }
}

impl FromStr for BlendMode {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    BlendMode::ALL
      .into_iter()
      .find(|mode| mode.name() == s.trim().to_ascii_lowercase())
      .ok_or_else(|| ConfigError::InvalidPreset(format!("未知的归约方式: {}", s)))
  }
}

impl fmt::Display for BlendMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// 通道选择：显式编号列表或按方差取前 k 个
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelection {
  /// 越界的编号在可视化时被丢弃
  Explicit(Vec<i64>),
  TopK(i64),
}

impl Default for ChannelSelection {
  fn default() -> Self {
    ChannelSelection::TopK(DEFAULT_TOP_K)
  }
}

impl ChannelSelection {
  pub fn k(&self) -> Option<i64> {
    match self {
      ChannelSelection::TopK(k) => Some(*k),
      ChannelSelection::Explicit(_) => None,
    }
  }
}

/// 可视化预设
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPreset", into = "RawPreset")]
pub struct VizPreset {
  pub id: String,
  pub layer_id: String,
  pub channels: ChannelSelection,
  pub blend_mode: BlendMode,
  pub cmap: ColorMap,
  pub overlay: bool,
  pub alpha: f32,
  pub extra: Map<String, Value>,
}

impl VizPreset {
  pub fn new(id: impl Into<String>, layer_id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      layer_id: layer_id.into(),
      channels: ChannelSelection::default(),
      blend_mode: BlendMode::default(),
      cmap: ColorMap::default(),
      overlay: false,
      alpha: DEFAULT_ALPHA,
      extra: Map::new(),
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.alpha) {
      return Err(ConfigError::InvalidPreset(format!(
        "alpha {} 超出 [0, 1]",
        self.alpha
      )));
    }
    Ok(())
  }
}

/// 持久化形式：`channels` 为列表或字符串 `"topk"`，`k` 只在 top-k 时有值
#[derive(Serialize, Deserialize)]
struct RawPreset {
  id: String,
  layer_id: String,
  #[serde(default = "RawChannels::top_k")]
  channels: RawChannels,
  #[serde(default)]
  k: Option<i64>,
  #[serde(default)]
  blend_mode: BlendMode,
  #[serde(default)]
  overlay: bool,
  #[serde(default = "default_alpha")]
  alpha: f32,
  #[serde(default)]
  cmap: ColorMap,
  #[serde(flatten)]
  extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawChannels {
  List(Vec<i64>),
  Mode(String),
}

impl RawChannels {
  fn top_k() -> Self {
    RawChannels::Mode("topk".to_string())
  }
}

fn default_alpha() -> f32 {
  DEFAULT_ALPHA
}

impl TryFrom<RawPreset> for VizPreset {
  type Error = ConfigError;

  fn try_from(raw: RawPreset) -> Result<Self, Self::Error> {
    let channels = match raw.channels {
      RawChannels::List(list) => ChannelSelection::Explicit(list),
      RawChannels::Mode(mode) if mode.eq_ignore_ascii_case("topk") => {
        ChannelSelection::TopK(raw.k.unwrap_or(DEFAULT_TOP_K))
      }
      RawChannels::Mode(mode) => {
        return Err(ConfigError::InvalidPreset(format!(
          "channels 只能是列表或 \"topk\"，实际为 {:?}",
          mode
        )));
      }
    };

    let preset = VizPreset {
      id: raw.id,
      layer_id: raw.layer_id,
      channels,
      blend_mode: raw.blend_mode,
      cmap: raw.cmap,
      overlay: raw.overlay,
      alpha: raw.alpha,
      extra: raw.extra,
    };
    preset.validate()?;
    Ok(preset)
  }
}

impl From<VizPreset> for RawPreset {
  fn from(preset: VizPreset) -> Self {
    let (channels, k) = match preset.channels {
      ChannelSelection::Explicit(list) => (RawChannels::List(list), None),
      ChannelSelection::TopK(k) => (RawChannels::top_k(), Some(k)),
    };
    RawPreset {
      id: preset.id,
      layer_id: preset.layer_id,
      channels,
      k,
      blend_mode: preset.blend_mode,
      overlay: preset.overlay,
      alpha: preset.alpha,
      cmap: preset.cmap,
      extra: preset.extra,
    }
  }
}

impl FromUrlWithScheme for VizPreset {
  const SCHEME: &'static str = "viz";
}

/// `viz://layer2?channels=topk&k=3&blend=mean&cmap=viridis&overlay=true&alpha=0.5`
impl FromUrl for VizPreset {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::InvalidPreset(format!(
        "预设 URL 必须使用 {} 方案",
        Self::SCHEME
      )));
    }
    let layer = url
      .host_str()
      .filter(|host| !host.is_empty())
      .ok_or_else(|| ConfigError::InvalidPreset("缺少层标识".to_string()))?;

    let mut preset = VizPreset::new(format!("url_{}", layer), layer);
    let mut k = None;
    let mut explicit = None;
    for (key, value) in url.query_pairs() {
      let invalid = |what: &str| ConfigError::InvalidPreset(format!("{} 无效: {}", what, value));
      match &*key {
        "id" => preset.id = value.to_string(),
        "channels" if value.eq_ignore_ascii_case("topk") => explicit = None,
        "channels" => {
          let list = value
            .split(',')
            .map(|index| index.trim().parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid("channels"))?;
          explicit = Some(list);
        }
        "k" => k = Some(value.parse::<i64>().map_err(|_| invalid("k"))?),
        "blend" | "blend_mode" => preset.blend_mode = value.parse()?,
        "cmap" => preset.cmap = ColorMap::parse_lenient(&value),
        "overlay" => preset.overlay = !matches!(&*value, "false" | "0" | "no"),
        "alpha" => preset.alpha = value.parse().map_err(|_| invalid("alpha"))?,
        _ => debug!("忽略未知参数: {}={}", key, value),
      }
    }

    preset.channels = match explicit {
      Some(list) => ChannelSelection::Explicit(list),
      None => ChannelSelection::TopK(k.unwrap_or(DEFAULT_TOP_K)),
    };
    preset.validate()?;
    Ok(preset)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
  #[serde(default = "default_model_name")]
  pub name: String,
  #[serde(default = "default_weights")]
  pub weights: String,
  /// 模型文件路径
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<PathBuf>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

fn default_model_name() -> String {
  "resnet18".to_string()
}

fn default_weights() -> String {
  "imagenet".to_string()
}

impl Default for ModelConfig {
  fn default() -> Self {
    Self {
      name: default_model_name(),
      weights: default_weights(),
      path: None,
      extra: Map::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTexts {
  pub global_page_title: String,
  pub home_button_label: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl GlobalTexts {
  pub fn from_title(title: &str) -> Self {
    Self {
      global_page_title: title.to_string(),
      home_button_label: "Home".to_string(),
      extra: Map::new(),
    }
  }
}

impl Default for GlobalTexts {
  fn default() -> Self {
    Self::from_title("Global")
  }
}

/// 模型层的说明文字
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLayerContent {
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subtitle: Option<String>,
  #[serde(default)]
  pub description: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl ModelLayerContent {
  pub fn placeholder(model_layer_id: &str) -> Self {
    Self {
      title: model_layer_id.to_string(),
      subtitle: None,
      description: String::new(),
      extra: Map::new(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
  /// 原样保存的收藏记录，读取时再校验
  #[serde(default)]
  pub favorites: Vec<Value>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl LayerMetadata {
  fn is_empty(&self) -> bool {
    self.favorites.is_empty() && self.extra.is_empty()
  }
}

/// 界面上的一个层按钮
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerUiConfig {
  pub id: String,
  pub order: i64,
  pub button_label: String,
  pub title_bar_label: String,
  pub description: String,
  pub viz_preset_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subtitle: Option<String>,
  #[serde(default, skip_serializing_if = "LayerMetadata::is_empty")]
  pub metadata: LayerMetadata,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
  pub title: String,
  #[serde(default = "default_language")]
  pub language: String,
  #[serde(default)]
  pub global_texts: GlobalTexts,
  #[serde(default)]
  pub layers: Vec<LayerUiConfig>,
  #[serde(default)]
  pub model_layers: BTreeMap<String, ModelLayerContent>,
  /// 模型层 → 选中的收藏名称
  #[serde(default)]
  pub selected_favorites: BTreeMap<String, Vec<String>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

fn default_language() -> String {
  "de".to_string()
}

/// 已校验的收藏
#[derive(Debug, Clone, PartialEq)]
pub struct Favorite {
  pub name: String,
  pub model_layer_id: String,
  pub preset: VizPreset,
}

impl Favorite {
  pub fn new(name: impl Into<String>, preset: VizPreset) -> Self {
    Self {
      name: name.into(),
      model_layer_id: preset.layer_id.clone(),
      preset,
    }
  }

  /// 解析持久化的收藏记录，缺少必需字段或取值越界时返回原因
  pub fn from_value(value: &Value, default_layer: &str) -> Result<Self, String> {
    let name = value
      .get("name")
      .and_then(Value::as_str)
      .ok_or("缺少 name")?
      .to_string();
    let mut preset = value
      .get("preset")
      .and_then(Value::as_object)
      .cloned()
      .ok_or("缺少 preset")?;

    let model_layer_id = match preset.get("model_layer_id") {
      None => default_layer.to_string(),
      Some(Value::String(id)) => id.clone(),
      Some(other) => return Err(format!("model_layer_id 类型错误: {}", other)),
    };
    preset
      .entry("id")
      .or_insert_with(|| json!(format!("fav_{}", name)));
    preset
      .entry("layer_id")
      .or_insert_with(|| json!(model_layer_id));
    preset
      .entry("alpha")
      .or_insert_with(|| json!(DEFAULT_FAVORITE_ALPHA));

    let preset: VizPreset =
      serde_json::from_value(Value::Object(preset)).map_err(|e| e.to_string())?;
    Ok(Self {
      name,
      model_layer_id,
      preset,
    })
  }

  pub fn to_value(&self) -> Value {
    let mut preset = match serde_json::to_value(&self.preset) {
      Ok(Value::Object(map)) => map,
      _ => Map::new(),
    };
    preset.remove("layer_id");
    if preset.get("id").and_then(Value::as_str) == Some(format!("fav_{}", self.name).as_str()) {
      preset.remove("id");
    }
    preset.insert("model_layer_id".to_string(), json!(self.model_layer_id));
    json!({ "name": self.name, "preset": preset })
  }
}

/// 展项配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
  #[serde(default = "current_version")]
  pub version: String,
  pub exhibit_id: String,
  #[serde(default)]
  pub model: ModelConfig,
  pub ui: UiConfig,
  #[serde(default, deserialize_with = "valid_presets")]
  pub viz_presets: Vec<VizPreset>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// 逐条解析预设，无效的预设被跳过而不影响其他配置
fn valid_presets<'de, D>(deserializer: D) -> Result<Vec<VizPreset>, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = Vec::<Value>::deserialize(deserializer)?;
  Ok(
    raw
      .into_iter()
      .filter_map(|value| {
        let id = value.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
        match serde_json::from_value::<VizPreset>(value) {
          Ok(preset) => Some(preset),
          Err(e) => {
            warn!("跳过无效的可视化预设 {}: {}", id, e);
            None
          }
        }
      })
      .collect(),
  )
}

fn current_version() -> String {
  migrations::CURRENT_VERSION.to_string()
}

impl Default for Settings {
  fn default() -> Self {
    let title = "Wie ein neuronales Netz sieht";
    let mut preset = VizPreset::new("preset_layer1", "layer1");
    preset.channels = ChannelSelection::Explicit(vec![0]);

    Self {
      version: current_version(),
      exhibit_id: "cnn_museum_01".to_string(),
      model: ModelConfig::default(),
      ui: UiConfig {
        title: title.to_string(),
        language: default_language(),
        global_texts: GlobalTexts::from_title(title),
        layers: vec![LayerUiConfig {
          id: "layer1_conv1".to_string(),
          order: 1,
          button_label: "Frühe Kanten".to_string(),
          title_bar_label: "Layer 1 – Kanten".to_string(),
          description:
            "In dieser Schicht erkennt das Netz einfache Kanten und Helligkeitsübergänge."
              .to_string(),
          viz_preset_id: "preset_layer1".to_string(),
          subtitle: None,
          metadata: LayerMetadata::default(),
          extra: Map::new(),
        }],
        model_layers: BTreeMap::new(),
        selected_favorites: BTreeMap::new(),
        extra: Map::new(),
      },
      viz_presets: vec![preset],
      extra: Map::new(),
    }
  }
}

impl Settings {
  pub fn preset(&self, id: &str) -> Option<&VizPreset> {
    self.viz_presets.iter().find(|preset| preset.id == id)
  }

  pub fn ui_layer(&self, ui_layer_id: &str) -> Option<&LayerUiConfig> {
    self.ui.layers.iter().find(|layer| layer.id == ui_layer_id)
  }

  /// 界面层的收藏默认归属的模型层：该层预设观察的层
  fn default_model_layer<'a>(&'a self, layer: &'a LayerUiConfig) -> &'a str {
    self
      .preset(&layer.viz_preset_id)
      .map(|preset| preset.layer_id.as_str())
      .unwrap_or(&layer.id)
  }

  fn all_favorites(&self) -> Vec<Favorite> {
    let mut favorites = Vec::new();
    for layer in &self.ui.layers {
      let default_layer = self.default_model_layer(layer);
      for value in &layer.metadata.favorites {
        match Favorite::from_value(value, default_layer) {
          Ok(favorite) => favorites.push(favorite),
          Err(reason) => warn!("跳过层 {} 中无效的收藏: {}", layer.id, reason),
        }
      }
    }
    favorites
  }

  pub fn favorites_for_model_layer(&self, model_layer_id: &str) -> Vec<Favorite> {
    self
      .all_favorites()
      .into_iter()
      .filter(|favorite| favorite.model_layer_id == model_layer_id)
      .collect()
  }

  /// 按选择顺序返回存在且有效的收藏，最多 3 个
  pub fn selected_favorites(&self, model_layer_id: &str) -> Vec<Favorite> {
    let Some(names) = self.ui.selected_favorites.get(model_layer_id) else {
      return Vec::new();
    };
    let available = self.favorites_for_model_layer(model_layer_id);
    names
      .iter()
      .filter_map(|name| available.iter().find(|favorite| &favorite.name == name))
      .take(MAX_FAVORITES)
      .cloned()
      .collect()
  }

  /// 去重后保留前 3 个名称，保持原顺序
  pub fn set_selected_favorites(&mut self, model_layer_id: &str, names: &[String]) {
    let mut kept: Vec<String> = Vec::with_capacity(MAX_FAVORITES);
    for name in names {
      if kept.len() == MAX_FAVORITES {
        break;
      }
      if !kept.contains(name) {
        kept.push(name.clone());
      }
    }
    self
      .ui
      .selected_favorites
      .insert(model_layer_id.to_string(), kept);
  }

  fn favorites_mut(&mut self, ui_layer_id: &str) -> Result<&mut Vec<Value>, ConfigError> {
    self
      .ui
      .layers
      .iter_mut()
      .find(|layer| layer.id == ui_layer_id)
      .map(|layer| &mut layer.metadata.favorites)
      .ok_or_else(|| ConfigError::UnknownLayer(ui_layer_id.to_string()))
  }

  /// 新增收藏，同一模型层下名称必须唯一
  pub fn add_favorite(&mut self, ui_layer_id: &str, favorite: Favorite) -> Result<(), ConfigError> {
    favorite.preset.validate()?;
    if self
      .favorites_for_model_layer(&favorite.model_layer_id)
      .iter()
      .any(|existing| existing.name == favorite.name)
    {
      return Err(ConfigError::DuplicateFavorite {
        model_layer_id: favorite.model_layer_id,
        name: favorite.name,
      });
    }
    self.favorites_mut(ui_layer_id)?.push(favorite.to_value());
    Ok(())
  }

  /// 按名称替换，不存在时追加
  pub fn upsert_favorite(
    &mut self,
    ui_layer_id: &str,
    favorite: Favorite,
  ) -> Result<(), ConfigError> {
    favorite.preset.validate()?;
    let value = favorite.to_value();
    let favorites = self.favorites_mut(ui_layer_id)?;
    match favorites
      .iter_mut()
      .find(|existing| existing.get("name").and_then(Value::as_str) == Some(favorite.name.as_str()))
    {
      Some(existing) => *existing = value,
      None => favorites.push(value),
    }
    Ok(())
  }

  /// 删除同名收藏；不存在时什么也不做，返回是否有删除
  pub fn delete_favorite(&mut self, ui_layer_id: &str, name: &str) -> bool {
    let Ok(favorites) = self.favorites_mut(ui_layer_id) else {
      return false;
    };
    let before = favorites.len();
    favorites.retain(|existing| existing.get("name").and_then(Value::as_str) != Some(name));
    before != favorites.len()
  }

  pub fn model_layer_content(&self, model_layer_id: &str) -> ModelLayerContent {
    self
      .ui
      .model_layers
      .get(model_layer_id)
      .cloned()
      .unwrap_or_else(|| ModelLayerContent::placeholder(model_layer_id))
  }
}
