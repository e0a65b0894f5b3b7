mod common;

use std::{
  sync::{Arc, atomic::AtomicBool},
  time::Duration,
};

use common::*;
use kanjian::{
  config::Favorite,
  task::{KioskTask, Task, TickLoop, TickState},
};

fn kiosk(opener: ScriptedOpener) -> TickLoop<ScriptedOpener, LatestImage> {
  let preset = VizPreset {
    channels: ChannelSelection::TopK(2),
    ..VizPreset::new("p", "layer2")
  };
  let (pipeline, _) = fake_pipeline(16, Duration::ZERO, preset);
  TickLoop::new(opener, pipeline, LatestImage::new()).with_interval(Duration::ZERO)
}

#[test]
fn read_failure_on_third_tick_stops_the_session() {
  let opener = ScriptedOpener::new(vec![0]).failing_on(3);
  let mut ticker = kiosk(opener.clone());
  ticker.start(0).unwrap();

  let stop = AtomicBool::new(false);
  let err = ticker.run(&stop).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::ReadFailure);
  assert_eq!(opener.reads(), 3);
  assert_eq!(opener.closes(), 1);
  assert_eq!(ticker.sink().rendered_count(), 2);
  assert_eq!(ticker.state(), TickState::Stopped);
  assert_eq!(ticker.last_failure(), Some(ErrorKind::ReadFailure));
  assert!(ticker.status_message().contains("ReadFailure"));

  // 会话结束后不再采集
  assert!(!ticker.tick().unwrap());
  assert_eq!(opener.reads(), 3);
}

#[test]
fn missing_camera_reports_device_unavailable() {
  let opener = ScriptedOpener::new(vec![]);
  let mut ticker = kiosk(opener);
  assert_eq!(
    ticker.first_device().unwrap_err().kind(),
    ErrorKind::DeviceUnavailable
  );
  assert_eq!(
    ticker.start(2).unwrap_err().kind(),
    ErrorKind::DeviceUnavailable
  );
  assert_eq!(ticker.state(), TickState::Stopped);
}

#[test]
fn stop_releases_device_and_can_restart() {
  let opener = ScriptedOpener::new(vec![1]);
  let mut ticker = kiosk(opener.clone());
  let device = ticker.first_device().unwrap();
  assert_eq!(device, 1);

  ticker.start(device).unwrap();
  assert!(ticker.tick().unwrap());
  ticker.stop();
  assert_eq!(opener.closes(), 2);
  assert_eq!(ticker.state(), TickState::Stopped);

  ticker.start(device).unwrap();
  assert!(ticker.tick().unwrap());
  assert_eq!(ticker.sink().rendered_count(), 2);
}

#[test]
fn kiosk_task_starts_from_favorite_preset() {
  let (engine, _) = fake_engine(&[("layer1", 8), ("layer2", 16)], Duration::ZERO);
  let pipeline = Pipeline::new(engine, VizPreset::new("p", "layer1")).unwrap();
  let favorite = Favorite::new(
    "kanten",
    VizPreset {
      channels: ChannelSelection::TopK(3),
      ..VizPreset::new("fav_kanten", "layer2")
    },
  );
  let opener = ScriptedOpener::new(vec![0]).failing_on(2);
  let sink = LatestImage::new();

  let err = KioskTask::default()
    .with_favorite(Some(favorite))
    .with_interval(Duration::ZERO)
    .with_stop_flag(Arc::new(AtomicBool::new(false)))
    .run_task(opener.clone(), pipeline, sink.clone())
    .unwrap_err();

  assert!(err.to_string().contains("读取失败"));
  assert_eq!(sink.rendered_count(), 1);
  assert_eq!(sink.get().unwrap().layer, "layer2");
  // 一次探测加一次会话，都已释放
  assert_eq!(opener.closes(), 2);
}
