// 该文件是 Kanjian （看见） 项目的一部分。
// src/task/ticker.rs - 固定间隔的单线程循环
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

use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
  sync::atomic::{AtomicBool, Ordering},
  thread,
  time::{Duration, Instant},
};

use tracing::{error, info, warn};

use crate::{
  config::Favorite,
  frame::Frame,
  input::{CaptureError, DeviceId, DeviceOpener, FrameSource, enumerate},
  output::{Render, Rendered},
  task::{ErrorKind, Pipeline, PipelineError},
};

/// 标称 30 fps
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_micros(33_333);
/// 选择收藏时探测的摄像头编号上限
pub const DEFAULT_MAX_PROBE: u32 = 10;

const STATUS_STOPPED: &str = "Live-Modus gestoppt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickState {
  Stopped,
  Live,
}

/// 展台驱动：`Stopped → Live → Stopped`
///
/// 每个 tick 同步执行一次采集、推理、可视化并更新输出。
/// 任何一步失败都立即停止、释放设备并给出状态文字，不自动重试。
pub struct TickLoop<O: DeviceOpener, R> {
  opener: O,
  sink: R,
  pipeline: Pipeline,
  source: Option<O::Source>,
  device: Option<DeviceId>,
  interval: Duration,
  max_probe: u32,
  favorite: Option<Favorite>,
  /// 按模型层记录本次会话隐藏的收藏名称
  hidden: BTreeMap<String, BTreeSet<String>>,
  status: String,
  last_failure: Option<ErrorKind>,
  ticks: u64,
  started: Option<Instant>,
}

impl<O, R> TickLoop<O, R>
where
  O: DeviceOpener,
  R: Render<Frame, Rendered>,
  R::Error: fmt::Display,
{
  pub fn new(opener: O, pipeline: Pipeline, sink: R) -> Self {
    Self {
      opener,
      sink,
      pipeline,
      source: None,
      device: None,
      interval: DEFAULT_TICK_INTERVAL,
      max_probe: DEFAULT_MAX_PROBE,
      favorite: None,
      hidden: BTreeMap::new(),
      status: STATUS_STOPPED.to_string(),
      last_failure: None,
      ticks: 0,
      started: None,
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_max_probe(mut self, max_probe: u32) -> Self {
    self.max_probe = max_probe;
    self
  }

  pub fn state(&self) -> TickState {
    if self.source.is_some() {
      TickState::Live
    } else {
      TickState::Stopped
    }
  }

  pub fn status_message(&self) -> &str {
    &self.status
  }

  /// 最近一次使会话结束的错误类别
  pub fn last_failure(&self) -> Option<ErrorKind> {
    self.last_failure
  }

  pub fn device(&self) -> Option<DeviceId> {
    self.device
  }

  pub fn ticks(&self) -> u64 {
    self.ticks
  }

  pub fn fps(&self) -> f64 {
    match self.started {
      Some(started) if started.elapsed().as_secs_f64() > 0.0 => {
        self.ticks as f64 / started.elapsed().as_secs_f64()
      }
      _ => 0.0,
    }
  }

  pub fn pipeline(&self) -> &Pipeline {
    &self.pipeline
  }

  pub fn sink(&self) -> &R {
    &self.sink
  }

  /// 第一个能打开的摄像头
  pub fn first_device(&self) -> Result<DeviceId, PipelineError> {
    enumerate(&self.opener, self.max_probe)
      .into_iter()
      .next()
      .ok_or_else(|| CaptureError::unavailable(0, "没有可用的摄像头").into())
  }

  /// 打开设备进入 Live；已有的句柄先释放
  pub fn start(&mut self, device: DeviceId) -> Result<(), PipelineError> {
    self.release();
    match self.opener.open(device) {
      Ok(source) => {
        self.source = Some(source);
        self.device = Some(device);
        self.ticks = 0;
        self.started = Some(Instant::now());
        self.last_failure = None;
        self.status = match &self.favorite {
          Some(favorite) => format!("Live-Modus aktiv für Favorit: {}", favorite.name),
          None => "Live-Modus aktiv".to_string(),
        };
        info!("摄像头 {} 已打开，进入实时模式", device);
        Ok(())
      }
      Err(e) => {
        let e = PipelineError::from(e);
        self.fail(&e);
        Err(e)
      }
    }
  }

  /// 执行一次采集、推理、可视化和输出
  ///
  /// 不在 Live 状态时什么也不做并返回 `Ok(false)`。
  pub fn tick(&mut self) -> Result<bool, PipelineError> {
    let Some(source) = self.source.as_mut() else {
      return Ok(false);
    };
    let result = self
      .pipeline
      .run_cycle(source)
      .and_then(|(frame, rendered)| {
        self
          .sink
          .render_result(&frame, &rendered)
          .map_err(PipelineError::render)
      });
    match result {
      Ok(()) => {
        self.ticks += 1;
        Ok(true)
      }
      Err(e) => {
        self.fail(&e);
        Err(e)
      }
    }
  }

  /// 按固定间隔调用 `tick`，直到停止标志置位、会话结束或出错
  pub fn run(&mut self, stop: &AtomicBool) -> Result<(), PipelineError> {
    while self.state() == TickState::Live && !stop.load(Ordering::Acquire) {
      let begin = Instant::now();
      self.tick()?;
      if let Some(rest) = self.interval.checked_sub(begin.elapsed()) {
        thread::sleep(rest);
      }
    }
    Ok(())
  }

  /// 停止并释放设备；可重复调用
  pub fn stop(&mut self) {
    if self.state() == TickState::Live {
      self.release();
      self.status = STATUS_STOPPED.to_string();
      info!("{}，共 {} 帧，{:.1} fps", STATUS_STOPPED, self.ticks, self.fps());
    }
  }

  /// 切换页面等显示上下文变化时调用，无条件停止
  pub fn switch_context(&mut self) {
    self.stop();
    self.favorite = None;
  }

  /// 选择收藏：停止当前会话，使用第一个可用摄像头，按收藏的预设开始实时显示
  pub fn select_favorite(&mut self, favorite: &Favorite) -> Result<(), PipelineError> {
    self.stop();
    if self.is_hidden(&favorite.model_layer_id, &favorite.name) {
      warn!(
        "层 {} 的收藏 {} 在本次会话中已隐藏",
        favorite.model_layer_id, favorite.name
      );
      return Ok(());
    }
    if let Err(e) = self.pipeline.set_preset(favorite.preset.clone()) {
      self.fail(&e);
      return Err(e);
    }
    self.favorite = Some(favorite.clone());
    let device = match self.first_device() {
      Ok(device) => device,
      Err(e) => {
        self.fail(&e);
        return Err(e);
      }
    };
    self.start(device)
  }

  pub fn active_favorite(&self) -> Option<&str> {
    self.favorite.as_ref().map(|favorite| favorite.name.as_str())
  }

  /// 本次会话内隐藏某个模型层的收藏，不写入配置；隐藏正在显示的收藏会停止会话
  pub fn hide_favorite(&mut self, model_layer_id: &str, name: &str) {
    self
      .hidden
      .entry(model_layer_id.to_string())
      .or_default()
      .insert(name.to_string());
    if self
      .favorite
      .as_ref()
      .is_some_and(|favorite| favorite.model_layer_id == model_layer_id && favorite.name == name)
    {
      self.stop();
      self.favorite = None;
    }
  }

  pub fn is_hidden(&self, model_layer_id: &str, name: &str) -> bool {
    self
      .hidden
      .get(model_layer_id)
      .is_some_and(|names| names.contains(name))
  }

  pub fn visible_favorites(&self, favorites: Vec<Favorite>) -> Vec<Favorite> {
    favorites
      .into_iter()
      .filter(|favorite| !self.is_hidden(&favorite.model_layer_id, &favorite.name))
      .collect()
  }

  fn release(&mut self) {
    if let Some(mut source) = self.source.take() {
      source.close();
    }
  }

  fn fail(&mut self, e: &PipelineError) {
    self.release();
    self.last_failure = Some(e.kind());
    self.status = format!("Fehler ({}): {}", e.kind(), e);
    error!("实时模式因错误停止: {}", e);
  }
}

impl<O: DeviceOpener, R> Drop for TickLoop<O, R> {
  fn drop(&mut self) {
    if let Some(mut source) = self.source.take() {
      source.close();
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
  use crate::{
    config::{ChannelSelection, VizPreset},
    model::{
      ActivationTensor, Backbone, CapturePoints, InferenceEngine, InputTensor, LayerSpec,
      ModelDescriptor, ModelError,
    },
    output::LatestImage,
  };

  struct PlainBackbone;

  impl Backbone for PlainBackbone {
    fn forward(&self, _: &InputTensor, capture: &mut CapturePoints) -> Result<(), ModelError> {
      for spec in capture.layers().to_vec() {
        let data = (0..spec.channels * 4).map(|v| v as f32).collect();
        capture.record(ActivationTensor::new(spec.id, [1, spec.channels, 2, 2], data)?);
      }
      Ok(())
    }
  }

  #[derive(Clone, Default)]
  struct Probe {
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
  }

  struct ProbeSource {
    probe: Probe,
    open: bool,
  }

  impl FrameSource for ProbeSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
      let n = self.probe.reads.fetch_add(1, Ordering::SeqCst) as u8;
      Ok(Frame::filled(4, 4, [n, n, n]))
    }

    fn close(&mut self) {
      if self.open {
        self.open = false;
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
      }
    }

    fn is_open(&self) -> bool {
      self.open
    }
  }

  /// 只有 `available` 中的编号能打开
  struct ProbeOpener {
    probe: Probe,
    available: Vec<DeviceId>,
  }

  impl DeviceOpener for ProbeOpener {
    type Source = ProbeSource;

    fn open(&self, device: DeviceId) -> Result<ProbeSource, CaptureError> {
      if !self.available.contains(&device) {
        return Err(CaptureError::unavailable(device, "不存在"));
      }
      self.probe.opens.fetch_add(1, Ordering::SeqCst);
      Ok(ProbeSource {
        probe: self.probe.clone(),
        open: true,
      })
    }
  }

  fn ticker(available: Vec<DeviceId>) -> (TickLoop<ProbeOpener, LatestImage>, Probe, LatestImage) {
    let descriptor = ModelDescriptor::custom(
      "fake",
      vec![LayerSpec::new("a", "a", 2), LayerSpec::new("b", "b", 3)],
    );
    let engine =
      InferenceEngine::with_backbone(descriptor, Some(&["a", "b"]), Box::new(PlainBackbone))
        .unwrap();
    let pipeline = Pipeline::new(engine, VizPreset::new("p", "a")).unwrap();
    let probe = Probe::default();
    let sink = LatestImage::new();
    let opener = ProbeOpener {
      probe: probe.clone(),
      available,
    };
    (
      TickLoop::new(opener, pipeline, sink.clone()).with_interval(Duration::ZERO),
      probe,
      sink,
    )
  }

  fn favorite(name: &str, layer: &str) -> Favorite {
    let mut preset = VizPreset::new(format!("fav_{}", name), layer);
    preset.channels = ChannelSelection::TopK(2);
    Favorite::new(name, preset)
  }

  #[test]
  fn ticks_render_into_sink() {
    let (mut ticker, probe, sink) = ticker(vec![0]);
    assert!(!ticker.tick().unwrap());
    ticker.start(0).unwrap();
    assert_eq!(ticker.state(), TickState::Live);
    assert!(ticker.tick().unwrap());
    assert!(ticker.tick().unwrap());
    assert_eq!(sink.rendered_count(), 2);
    assert_eq!(ticker.ticks(), 2);

    ticker.stop();
    ticker.stop();
    assert_eq!(ticker.state(), TickState::Stopped);
    assert_eq!(ticker.status_message(), "Live-Modus gestoppt");
    assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn open_failure_reports_device_unavailable() {
    let (mut ticker, _, _) = ticker(vec![]);
    let err = ticker.start(3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    assert_eq!(ticker.state(), TickState::Stopped);
    assert!(ticker.status_message().starts_with("Fehler"));
  }

  #[test]
  fn selecting_favorite_uses_first_camera_and_releases_old_handle() {
    let (mut ticker, probe, _) = ticker(vec![2, 5]);
    ticker.start(5).unwrap();

    ticker.select_favorite(&favorite("kanten", "b")).unwrap();
    assert_eq!(ticker.device(), Some(2));
    assert_eq!(ticker.pipeline().preset().layer_id, "b");
    assert_eq!(
      ticker.status_message(),
      "Live-Modus aktiv für Favorit: kanten"
    );
    // 旧句柄 + 两次探测 + 新句柄
    assert_eq!(probe.opens.load(Ordering::SeqCst), 4);
    assert_eq!(probe.closes.load(Ordering::SeqCst), 3);

    ticker.switch_context();
    assert_eq!(ticker.state(), TickState::Stopped);
    assert_eq!(probe.closes.load(Ordering::SeqCst), 4);
  }

  #[test]
  fn hidden_favorite_is_not_started() {
    let (mut ticker, _, _) = ticker(vec![0]);
    ticker.select_favorite(&favorite("a1", "a")).unwrap();
    ticker.hide_favorite("a", "a1");
    assert_eq!(ticker.state(), TickState::Stopped);
    assert!(ticker.active_favorite().is_none());

    ticker.select_favorite(&favorite("a1", "a")).unwrap();
    assert_eq!(ticker.state(), TickState::Stopped);
    let visible = ticker.visible_favorites(vec![favorite("a1", "a"), favorite("a2", "a")]);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].name, "a2");
  }

  #[test]
  fn hidden_favorite_only_affects_its_model_layer() {
    let (mut ticker, _, _) = ticker(vec![0]);
    ticker.hide_favorite("a", "shared");
    assert!(ticker.is_hidden("a", "shared"));
    assert!(!ticker.is_hidden("b", "shared"));

    ticker.select_favorite(&favorite("shared", "b")).unwrap();
    assert_eq!(ticker.state(), TickState::Live);
    assert_eq!(ticker.active_favorite(), Some("shared"));

    let visible =
      ticker.visible_favorites(vec![favorite("shared", "a"), favorite("shared", "b")]);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].model_layer_id, "b");
  }

  #[test]
  fn run_observes_stop_flag() {
    let (mut ticker, probe, _) = ticker(vec![0]);
    ticker.start(0).unwrap();
    let stop = AtomicBool::new(true);
    ticker.run(&stop).unwrap();
    assert_eq!(probe.reads.load(Ordering::SeqCst), 0);
  }
}
