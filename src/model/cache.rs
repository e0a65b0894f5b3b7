// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/cache.rs - 激活缓存
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

use std::sync::Arc;

use tracing::debug;

use crate::{
  frame::{Fingerprint, Frame},
  model::{Activations, InferenceEngine, ModelError},
};

/// 只保存最近一帧的激活；指纹相同即视为命中
#[derive(Debug, Default)]
pub struct ActivationCache {
  entry: Option<(Fingerprint, Arc<Activations>)>,
}

impl ActivationCache {
  pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Activations>> {
    match &self.entry {
      Some((stored, activations)) if stored == fingerprint => Some(activations.clone()),
      _ => None,
    }
  }

  pub fn store(&mut self, fingerprint: Fingerprint, activations: Activations) -> Arc<Activations> {
    let activations = Arc::new(activations);
    self.entry = Some((fingerprint, activations.clone()));
    activations
  }

  pub fn fingerprint(&self) -> Option<Fingerprint> {
    self.entry.as_ref().map(|(fingerprint, _)| *fingerprint)
  }

  pub fn invalidate(&mut self) {
    self.entry = None;
  }
}

/// 带缓存的推理引擎
pub struct CachedEngine {
  engine: InferenceEngine,
  cache: ActivationCache,
  hits: u64,
  misses: u64,
}

impl CachedEngine {
  pub fn new(engine: InferenceEngine) -> Self {
    Self {
      engine,
      cache: ActivationCache::default(),
      hits: 0,
      misses: 0,
    }
  }

  pub fn infer(&mut self, frame: &Frame) -> Result<Arc<Activations>, ModelError> {
    let fingerprint = frame.fingerprint();
    if let Some(activations) = self.cache.get(&fingerprint) {
      self.hits += 1;
      debug!("激活缓存命中: {:?}", fingerprint);
      return Ok(activations);
    }

    self.misses += 1;
    let activations = self.engine.infer(frame)?;
    Ok(self.cache.store(fingerprint, activations))
  }

  pub fn engine(&self) -> &InferenceEngine {
    &self.engine
  }

  pub fn hits(&self) -> u64 {
    self.hits
  }

  pub fn misses(&self) -> u64 {
    self.misses
  }

  pub fn invalidate(&mut self) {
    self.cache.invalidate();
  }
}

impl From<InferenceEngine> for CachedEngine {
  fn from(engine: InferenceEngine) -> Self {
    Self::new(engine)
  }
}
