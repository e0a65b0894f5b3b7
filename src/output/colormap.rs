// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/colormap.rs - 颜色映射
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

use std::{fmt, str::FromStr, sync::LazyLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::warn;

pub type Lut = [[u8; 3]; 256];

/// 颜色映射：查找表或单通道着色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMap {
  #[default]
  Viridis,
  Magma,
  Inferno,
  Plasma,
  Jet,
  /// 灰度写入红色通道
  Red,
  Green,
  Blue,
}

impl ColorMap {
  pub const ALL: [ColorMap; 8] = [
    ColorMap::Viridis,
    ColorMap::Magma,
    ColorMap::Inferno,
    ColorMap::Plasma,
    ColorMap::Jet,
    ColorMap::Red,
    ColorMap::Green,
    ColorMap::Blue,
  ];

  pub fn name(self) -> &'static str {
    match self {
      ColorMap::Viridis => "viridis",
      ColorMap::Magma => "magma",
      ColorMap::Inferno => "inferno",
      ColorMap::Plasma => "plasma",
      ColorMap::Jet => "jet",
      ColorMap::Red => "red",
      ColorMap::Green => "green",
      ColorMap::Blue => "blue",
    }
  }

  /// 宽松解析：未知名称回退到 viridis
  pub fn parse_lenient(name: &str) -> Self {
    name.parse().unwrap_or_else(|_| {
      warn!("未知的颜色映射 '{}'，使用 viridis", name);
      ColorMap::default()
    })
  }

  /// 着色模式写入的输出通道
  pub fn tint_channel(self) -> Option<usize> {
    match self {
      ColorMap::Red => Some(0),
      ColorMap::Green => Some(1),
      ColorMap::Blue => Some(2),
      _ => None,
    }
  }

  pub fn lut(self) -> Option<&'static Lut> {
    match self {
      ColorMap::Viridis => Some(&VIRIDIS),
      ColorMap::Magma => Some(&MAGMA),
      ColorMap::Inferno => Some(&INFERNO),
      ColorMap::Plasma => Some(&PLASMA),
      ColorMap::Jet => Some(&JET),
      ColorMap::Red | ColorMap::Green | ColorMap::Blue => None,
    }
  }

  /// 单个灰度值对应的颜色
  pub fn apply(self, value: u8) -> [u8; 3] {
    if let Some(lut) = self.lut() {
      return lut[value as usize];
    }
    let mut rgb = [0u8; 3];
    if let Some(channel) = self.tint_channel() {
      rgb[channel] = value;
    }
    rgb
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("未知的颜色映射: {0}")]
pub struct UnknownColorMap(pub String);

impl FromStr for ColorMap {
  type Err = UnknownColorMap;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "viridis" => Ok(ColorMap::Viridis),
      "magma" => Ok(ColorMap::Magma),
      "inferno" => Ok(ColorMap::Inferno),
      "plasma" => Ok(ColorMap::Plasma),
      "jet" => Ok(ColorMap::Jet),
      "red" | "r" => Ok(ColorMap::Red),
      "green" | "g" => Ok(ColorMap::Green),
      "blue" | "b" => Ok(ColorMap::Blue),
      _ => Err(UnknownColorMap(s.to_string())),
    }
  }
}

impl fmt::Display for ColorMap {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl Serialize for ColorMap {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.name())
  }
}

// 持久化的配置里可能出现任意字符串，这里不报错
impl<'de> Deserialize<'de> for ColorMap {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let name = String::deserialize(deserializer)?;
    Ok(ColorMap::parse_lenient(&name))
  }
}

// 6 次多项式拟合的 matplotlib 色表，每行依次为 t^0..t^6 的 RGB 系数
type Poly = [[f64; 3]; 7];

const VIRIDIS_POLY: Poly = [
  [0.2777273272234177, 0.005407344544966578, 0.3340998053353061],
  [0.1050930431085774, 1.404613529898575, 1.384590162594685],
  [-0.3308618287255563, 0.214847559468213, 0.09509516302823659],
  [-4.634230498983486, -5.799100973351585, -19.33244095627987],
  [6.228269936347081, 14.17993336680509, 56.69055260068105],
  [4.776384997670288, -13.74514537774601, -65.35303263337234],
  [-5.435455855934631, 4.645852612178535, 26.3124352495832],
];

const PLASMA_POLY: Poly = [
  [0.05873234392399702, 0.02333670892565664, 0.5433401826748754],
  [2.176514634195958, 0.2383834171260182, 0.7539604599784036],
  [-2.689460476458034, -7.455851135738909, 3.110799939717086],
  [6.130348345893603, 42.3461881477227, -28.51885465332158],
  [-11.10743619062271, -82.66631109428045, 60.13984767418263],
  [10.02306557647065, 71.41361770095349, -54.07218655560067],
  [-3.658713842777788, -22.93153465461149, 18.19190778539828],
];

const MAGMA_POLY: Poly = [
  [-0.002136485053939582, -0.000749655052795221, -0.005386127855323933],
  [0.2516605407371642, 0.6775232436837668, 2.494026599312351],
  [8.353717279216625, -3.577719514958484, 0.3144679030132573],
  [-27.66873308576866, 14.26473078096533, -13.64921318813922],
  [52.17613981234068, -27.94360607168351, 12.94416944238394],
  [-50.76852536473588, 29.04658282127291, 4.23415299384598],
  [18.65570506591883, -11.48977351997711, -5.601961508734096],
];

const INFERNO_POLY: Poly = [
  [0.0002189403691192265, 0.001651004631001012, -0.01948089843709184],
  [0.1065134194856116, 0.5639564367884091, 3.932712388889277],
  [11.60249308247187, -3.972853965665698, -15.9423941062914],
  [-41.70399613139459, 17.43639888205313, 44.35414519872813],
  [77.162935699427, -33.40235894210092, -81.80730925738993],
  [-71.31942824499214, 32.62606426397723, 73.20951985803202],
  [25.13112622477341, -12.24266895238567, -23.07032500287172],
];

static VIRIDIS: LazyLock<Lut> = LazyLock::new(|| poly_lut(&VIRIDIS_POLY));
static PLASMA: LazyLock<Lut> = LazyLock::new(|| poly_lut(&PLASMA_POLY));
static MAGMA: LazyLock<Lut> = LazyLock::new(|| poly_lut(&MAGMA_POLY));
static INFERNO: LazyLock<Lut> = LazyLock::new(|| poly_lut(&INFERNO_POLY));
static JET: LazyLock<Lut> = LazyLock::new(jet_lut);

fn to_u8(value: f64) -> u8 {
  (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn poly_lut(poly: &Poly) -> Lut {
  let mut lut = [[0u8; 3]; 256];
  for (i, entry) in lut.iter_mut().enumerate() {
    let t = i as f64 / 255.0;
    for c in 0..3 {
      // Horner
      let value = poly.iter().rev().fold(0.0, |acc, coeffs| acc * t + coeffs[c]);
      entry[c] = to_u8(value);
    }
  }
  lut
}

fn jet_lut() -> Lut {
  let mut lut = [[0u8; 3]; 256];
  for (i, entry) in lut.iter_mut().enumerate() {
    let t = i as f64 / 255.0;
    let r = 1.5 - (4.0 * t - 3.0).abs();
    let g = 1.5 - (4.0 * t - 2.0).abs();
    let b = 1.5 - (4.0 * t - 1.0).abs();
    *entry = [to_u8(r), to_u8(g), to_u8(b)];
  }
  lut
}
