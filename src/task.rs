// 该文件是 Kanjian （看见） 项目的一部分。
// src/task.rs - 流水线与任务
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
  fmt,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{Favorite, VizPreset},
  frame::Frame,
  input::{CaptureError, DeviceId, DeviceOpener, FrameSource},
  model::{InferenceEngine, ModelError, cache::CachedEngine},
  output::{Render, Rendered, VisualizationError, Visualizer},
};

pub mod decoupled;
pub mod ticker;

pub use self::decoupled::{DecoupledLoop, FrameSubmitter, LoopState, SlotPolicy};
pub use self::ticker::{TickLoop, TickState};

/// 对外报告的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  DeviceUnavailable,
  ReadFailure,
  UnsupportedModel,
  UnknownLayer,
  InferenceFailure,
  VisualizationFailure,
  RenderFailure,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::DeviceUnavailable => "DeviceUnavailable",
      ErrorKind::ReadFailure => "ReadFailure",
      ErrorKind::UnsupportedModel => "UnsupportedModel",
      ErrorKind::UnknownLayer => "UnknownLayer",
      ErrorKind::InferenceFailure => "InferenceFailure",
      ErrorKind::VisualizationFailure => "VisualizationFailure",
      ErrorKind::RenderFailure => "RenderFailure",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("采集错误: {0}")]
  Capture(#[from] CaptureError),
  #[error("模型错误: {0}")]
  Model(#[from] ModelError),
  #[error("可视化错误: {0}")]
  Visualization(#[from] VisualizationError),
  #[error("输出错误: {0}")]
  Render(String),
}

impl PipelineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      PipelineError::Capture(CaptureError::ReadFailure { .. }) => ErrorKind::ReadFailure,
      PipelineError::Capture(_) => ErrorKind::DeviceUnavailable,
      PipelineError::Model(ModelError::UnsupportedModel(_) | ModelError::ModelLoad(_)) => {
        ErrorKind::UnsupportedModel
      }
      PipelineError::Model(ModelError::UnknownLayer { .. }) => ErrorKind::UnknownLayer,
      PipelineError::Model(_) => ErrorKind::InferenceFailure,
      PipelineError::Visualization(_) => ErrorKind::VisualizationFailure,
      PipelineError::Render(_) => ErrorKind::RenderFailure,
    }
  }

  pub fn render(error: impl fmt::Display) -> Self {
    PipelineError::Render(error.to_string())
  }
}

/// 采集 → 推理 → 可视化
///
/// 两种驱动共用同一条流水线，只有调度方式不同。
pub struct Pipeline {
  engine: CachedEngine,
  visualizer: Visualizer,
  preset: VizPreset,
}

impl Pipeline {
  /// 预设观察的层必须是引擎的活动层之一
  pub fn new(engine: impl Into<CachedEngine>, preset: VizPreset) -> Result<Self, PipelineError> {
    let engine = engine.into();
    check_preset(engine.engine(), &preset)?;
    Ok(Self {
      engine,
      visualizer: Visualizer::default(),
      preset,
    })
  }

  pub fn with_visualizer(mut self, visualizer: Visualizer) -> Self {
    self.visualizer = visualizer;
    self
  }

  pub fn preset(&self) -> &VizPreset {
    &self.preset
  }

  /// 切换预设；同一帧的激活仍然可以命中缓存
  pub fn set_preset(&mut self, preset: VizPreset) -> Result<(), PipelineError> {
    check_preset(self.engine.engine(), &preset)?;
    info!("切换预设: {} (层 {})", preset.id, preset.layer_id);
    self.preset = preset;
    Ok(())
  }

  pub fn engine(&self) -> &CachedEngine {
    &self.engine
  }

  /// 对一帧做推理和可视化
  pub fn process(&mut self, frame: &Frame) -> Result<Rendered, PipelineError> {
    let now = Instant::now();
    let activations = self.engine.infer(frame)?;
    let image = self
      .visualizer
      .visualize_layer(&activations, &self.preset, Some(frame))?;
    debug!("流水线处理完成，耗时: {:.2?}", now.elapsed());
    Ok(Rendered {
      layer: self.preset.layer_id.clone(),
      frame: frame.clone(),
      fingerprint: frame.fingerprint(),
      image,
    })
  }

  /// 从来源读一帧并处理，返回帧和结果
  pub fn run_cycle<S: FrameSource + ?Sized>(
    &mut self,
    source: &mut S,
  ) -> Result<(Frame, Rendered), PipelineError> {
    let frame = source.read()?;
    let rendered = self.process(&frame)?;
    Ok((frame, rendered))
  }
}

fn check_preset(engine: &InferenceEngine, preset: &VizPreset) -> Result<(), PipelineError> {
  if preset.validate().is_err() {
    return Err(VisualizationError::InvalidAlpha(preset.alpha).into());
  }
  if !engine.get_active_layers().contains(&preset.layer_id.as_str()) {
    return Err(
      ModelError::UnknownLayer {
        model: engine.descriptor().name().to_string(),
        layer: preset.layer_id.clone(),
      }
      .into(),
    );
  }
  Ok(())
}

/// Ctrl-C 时置位的停止标志
pub fn install_interrupt_flag() -> anyhow::Result<Arc<AtomicBool>> {
  let stop = Arc::new(AtomicBool::new(false));
  let flag = stop.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    flag.store(true, Ordering::Release);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(stop)
}

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 读一帧、处理、输出一次
pub struct OneShotTask;

impl<I, O, RE> Task<I, Pipeline, O> for OneShotTask
where
  I: FrameSource,
  O: Render<Frame, Rendered, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, mut model: Pipeline, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let now = Instant::now();
    let result = model.run_cycle(&mut input);
    input.close();
    let (frame, rendered) = result?;
    info!("推理与可视化完成，耗时: {:.2?}", now.elapsed());
    output.render_result(&frame, &rendered)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());
    Ok(())
  }
}

/// 连续采集，推理放在后台线程
///
/// 当前线程只负责读帧、投递和输出最新结果，采集不会被推理阻塞。
#[derive(Debug, Default)]
pub struct LiveTask {
  frame_number: Option<usize>,
  policy: SlotPolicy,
  stop: Option<Arc<AtomicBool>>,
}

impl LiveTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_policy(mut self, policy: SlotPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// 外部停止标志；不设置时安装 Ctrl-C 处理
  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = Some(stop);
    self
  }
}

impl<I, O, RE> Task<I, Pipeline, O> for LiveTask
where
  I: FrameSource,
  O: Render<Frame, Rendered, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: Pipeline, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let stop = match self.stop {
      Some(stop) => stop,
      None => install_interrupt_flag()?,
    };

    let mut driver = DecoupledLoop::new(model).with_policy(self.policy);
    let submitter = driver.submitter();
    driver.start()?;

    let mut frame_index = 0usize;
    let mut outcome = Ok(());
    while !stop.load(Ordering::Acquire) {
      let frame = match input.read() {
        Ok(frame) => frame,
        Err(e) => {
          outcome = Err(PipelineError::from(e));
          break;
        }
      };
      frame_index += 1;
      submitter.submit(frame);

      if let Some(rendered) = driver.latest_result() {
        if let Err(e) = output.render_result(&rendered.frame, &rendered) {
          outcome = Err(PipelineError::render(e));
          break;
        }
      }
      if driver.status().state != LoopState::Running {
        warn!("后台流水线已停止，退出任务循环");
        break;
      }
      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
    }

    driver.stop();
    input.close();
    let status = driver.status();
    info!(
      "任务结束: 投递 {} 帧, 处理 {} 帧, {:.1} fps",
      frame_index, status.processed, status.fps
    );
    if let Some(failure) = status.last_error {
      anyhow::bail!("流水线失败 ({}): {}", failure.kind, failure.message);
    }
    outcome?;
    Ok(())
  }
}

/// 展台模式：固定间隔驱动单线程流水线，失败即停止
#[derive(Debug, Default)]
pub struct KioskTask {
  device: Option<DeviceId>,
  favorite: Option<Favorite>,
  interval: Option<Duration>,
  stop: Option<Arc<AtomicBool>>,
}

impl KioskTask {
  /// 不指定时使用第一个探测到的摄像头
  pub fn with_device(mut self, device: Option<DeviceId>) -> Self {
    self.device = device;
    self
  }

  /// 以收藏开始：使用第一个可用的摄像头和收藏的预设，忽略指定的设备
  pub fn with_favorite(mut self, favorite: Option<Favorite>) -> Self {
    self.favorite = favorite;
    self
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = Some(interval);
    self
  }

  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = Some(stop);
    self
  }
}

impl<D, O, RE> Task<D, Pipeline, O> for KioskTask
where
  D: DeviceOpener,
  O: Render<Frame, Rendered, Error = RE>,
  RE: fmt::Display,
{
  type Error = anyhow::Error;

  fn run_task(self, input: D, model: Pipeline, output: O) -> Result<(), Self::Error> {
    info!("开始展台任务...");
    let stop = match self.stop {
      Some(stop) => stop,
      None => install_interrupt_flag()?,
    };

    let mut ticker = TickLoop::new(input, model, output);
    if let Some(interval) = self.interval {
      ticker = ticker.with_interval(interval);
    }
    match (&self.favorite, self.device) {
      (Some(favorite), _) => ticker.select_favorite(favorite)?,
      (None, Some(device)) => ticker.start(device)?,
      (None, None) => {
        let device = ticker.first_device()?;
        ticker.start(device)?;
      }
    }
    let result = ticker.run(&stop);
    ticker.stop();
    info!("{}", ticker.status_message());
    result?;
    Ok(())
  }
}
