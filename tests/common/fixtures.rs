use std::{
  collections::VecDeque,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  thread,
  time::Duration,
};

use kanjian::{
  config::VizPreset,
  frame::Frame,
  input::{CaptureError, DeviceId, DeviceOpener, FrameSource},
  model::{
    ActivationTensor, Backbone, CapturePoints, InferenceEngine, InputTensor, LayerSpec,
    ModelDescriptor, ModelError,
  },
  task::Pipeline,
};

/// 假激活每个通道的空间边长
pub const FAKE_SPATIAL: usize = 7;

/// 为每个请求的层生成激活的假骨干网络
///
/// 通道 `c` 在 `0` 和 `c + 1` 之间交替，方差随 `c` 增大，top-k 总是选中编号最大的通道。
pub struct FakeBackbone {
  pub latency: Duration,
  pub calls: Arc<AtomicUsize>,
}

impl Backbone for FakeBackbone {
  fn forward(&self, input: &InputTensor, capture: &mut CapturePoints) -> Result<(), ModelError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if !self.latency.is_zero() {
      thread::sleep(self.latency);
    }
    let offset = input.data()[0];
    let plane = FAKE_SPATIAL * FAKE_SPATIAL;
    for spec in capture.layers().to_vec() {
      let mut data = Vec::with_capacity(spec.channels * plane);
      for c in 0..spec.channels {
        for p in 0..plane {
          let high = if p % 2 == 0 { (c + 1) as f32 } else { 0.0 };
          data.push(high + offset);
        }
      }
      capture.record(ActivationTensor::new(
        spec.id,
        [1, spec.channels, FAKE_SPATIAL, FAKE_SPATIAL],
        data,
      )?);
    }
    Ok(())
  }
}

/// 基于假层注册表的引擎，列出的层全部激活
pub fn fake_engine(layers: &[(&str, usize)], latency: Duration) -> (InferenceEngine, Arc<AtomicUsize>) {
  let registry = layers
    .iter()
    .map(|(id, channels)| LayerSpec::new(*id, *id, *channels))
    .collect();
  let descriptor = ModelDescriptor::custom("fake", registry);
  let calls = Arc::new(AtomicUsize::new(0));
  let backbone = FakeBackbone {
    latency,
    calls: calls.clone(),
  };
  let active: Vec<&str> = layers.iter().map(|(id, _)| *id).collect();
  let engine = InferenceEngine::with_backbone(descriptor, Some(&active), Box::new(backbone))
    .expect("fake engine");
  (engine, calls)
}

pub fn fake_pipeline(channels: usize, latency: Duration, preset: VizPreset) -> (Pipeline, Arc<AtomicUsize>) {
  let (engine, calls) = fake_engine(&[(preset.layer_id.as_str(), channels)], latency);
  (Pipeline::new(engine, preset).expect("pipeline"), calls)
}

pub fn gray_frame(side: u32, shade: u8) -> Frame {
  Frame::filled(side, side, [shade, shade, shade])
}

/// 第 `n` 次读取（从 1 计）失败，其余读取成功
pub struct ScriptedSource {
  pub device: DeviceId,
  pub fail_on: Option<usize>,
  pub reads: Arc<AtomicUsize>,
  pub closes: Arc<AtomicUsize>,
  pub frames: VecDeque<Frame>,
  open: bool,
}

impl FrameSource for ScriptedSource {
  fn read(&mut self) -> Result<Frame, CaptureError> {
    let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
    if self.fail_on == Some(n) {
      return Err(CaptureError::read_failure(self.device, format!("scripted failure on read {}", n)));
    }
    let frame = self
      .frames
      .pop_front()
      .unwrap_or_else(|| gray_frame(32, (n % 256) as u8));
    Ok(frame)
  }

  fn close(&mut self) {
    if self.open {
      self.open = false;
      self.closes.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn is_open(&self) -> bool {
    self.open
  }
}

/// 打开的 [`ScriptedSource`] 共享计数器
#[derive(Clone, Default)]
pub struct ScriptedOpener {
  pub available: Vec<DeviceId>,
  pub fail_on: Option<usize>,
  pub reads: Arc<AtomicUsize>,
  pub closes: Arc<AtomicUsize>,
}

impl ScriptedOpener {
  pub fn new(available: Vec<DeviceId>) -> Self {
    Self {
      available,
      ..Self::default()
    }
  }

  pub fn failing_on(mut self, read: usize) -> Self {
    self.fail_on = Some(read);
    self
  }

  pub fn reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  pub fn closes(&self) -> usize {
    self.closes.load(Ordering::SeqCst)
  }
}

impl DeviceOpener for ScriptedOpener {
  type Source = ScriptedSource;

  fn open(&self, device: DeviceId) -> Result<ScriptedSource, CaptureError> {
    if !self.available.contains(&device) {
      return Err(CaptureError::unavailable(device, "no such device"));
    }
    Ok(ScriptedSource {
      device,
      fail_on: self.fail_on,
      reads: self.reads.clone(),
      closes: self.closes.clone(),
      frames: VecDeque::new(),
      open: true,
    })
  }
}
