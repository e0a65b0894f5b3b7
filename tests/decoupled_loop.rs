mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use kanjian::task::{DecoupledLoop, LoopState};

fn layer1_preset() -> VizPreset {
  VizPreset {
    channels: ChannelSelection::Explicit(vec![0]),
    ..VizPreset::new("p", "layer1")
  }
}

#[test]
fn burst_before_worker_picks_up_delivers_only_latest() {
  let (pipeline, calls) = fake_pipeline(8, Duration::ZERO, layer1_preset());
  let mut driver = DecoupledLoop::new(pipeline);
  let submitter = driver.submitter();

  let frames: Vec<Frame> = (1..=5).map(|i| gray_frame(16, i * 40)).collect();
  for frame in &frames {
    submitter.submit(frame.clone());
  }
  driver.start().unwrap();
  assert!(driver.wait_idle(Duration::from_secs(5)));

  let delivered = driver.latest_result().expect("one result");
  assert_eq!(delivered.fingerprint, frames[4].fingerprint());
  assert!(driver.latest_result().is_none());
  assert_eq!(calls.load(Ordering::SeqCst), 1);

  let status = driver.status();
  assert_eq!(status.submitted, 5);
  assert_eq!(status.dropped, 4);
  assert_eq!(status.processed, 1);
  driver.stop();
  assert_eq!(driver.state(), LoopState::Idle);
}

#[test]
fn slow_worker_skips_stale_frames() {
  let (pipeline, calls) = fake_pipeline(8, Duration::from_millis(150), layer1_preset());
  let mut driver = DecoupledLoop::new(pipeline);
  let submitter = driver.submitter();
  driver.start().unwrap();

  let frames: Vec<Frame> = (1..=5).map(|i| gray_frame(16, i * 40)).collect();
  for frame in &frames {
    submitter.submit(frame.clone());
    std::thread::sleep(Duration::from_millis(5));
  }
  assert!(driver.wait_idle(Duration::from_secs(5)));

  let processed = calls.load(Ordering::SeqCst);
  assert!(processed <= 2, "processed {} frames", processed);
  let delivered = driver.latest_result().expect("latest result");
  assert_eq!(delivered.fingerprint, frames[4].fingerprint());
  assert!(driver.latest_result().is_none());
}

#[cfg(feature = "read_image_file")]
#[test]
fn live_task_renders_frames_from_its_input() {
  use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  };

  use kanjian::{
    input::ImageFileInput,
    task::{LiveTask, Task},
  };

  let (pipeline, calls) = fake_pipeline(8, Duration::from_millis(2), layer1_preset());
  let frame = gray_frame(16, 90);
  let input = ImageFileInput::from_frame(frame.clone());
  let sink = LatestImage::new();

  LiveTask::default()
    .with_frame_number(Some(500))
    .with_stop_flag(Arc::new(AtomicBool::new(false)))
    .run_task(input, pipeline, sink.clone())
    .unwrap();

  assert!(calls.load(Ordering::SeqCst) <= 500);
  if let Some(rendered) = sink.get() {
    assert_eq!(rendered.fingerprint, frame.fingerprint());
    assert_eq!(rendered.layer, "layer1");
  }
}
