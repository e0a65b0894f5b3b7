mod common;

use std::time::Duration;

use common::*;
use kanjian::output::visualizer::{normalize, reduce, select_channels};

fn spatial_only(frame: &Frame, preset: VizPreset, channels: usize) -> kanjian::output::Rendered {
  let (mut pipeline, _) = fake_pipeline(channels, Duration::ZERO, preset);
  pipeline.process(frame).unwrap()
}

#[test]
fn explicit_single_channel_mean_matches_activation_resolution() {
  let frame = gray_frame(224, 128);
  let preset = VizPreset {
    channels: ChannelSelection::Explicit(vec![0]),
    blend_mode: BlendMode::Mean,
    cmap: ColorMap::Viridis,
    overlay: false,
    ..VizPreset::new("gray_mean", "conv_8")
  };

  let rendered = spatial_only(&frame, preset, 8);
  assert_eq!(
    rendered.image.dimensions(),
    (FAKE_SPATIAL as u32, FAKE_SPATIAL as u32)
  );
  assert_eq!(rendered.image.as_raw().len(), FAKE_SPATIAL * FAKE_SPATIAL * 3);
  assert_eq!(rendered.layer, "conv_8");
  assert_eq!(rendered.fingerprint, frame.fingerprint());
}

#[test]
fn top_k_picks_highest_variance_channels() {
  let frame = gray_frame(224, 128);
  let (engine, _) = fake_engine(&[("wide", 64)], Duration::ZERO);
  let activations = engine.infer(&frame).unwrap();
  let activation = &activations["wide"];

  assert_eq!(
    select_channels(activation, &ChannelSelection::TopK(3)),
    vec![61, 62, 63]
  );
  assert_eq!(select_channels(activation, &ChannelSelection::TopK(0)), vec![63]);
  assert_eq!(select_channels(activation, &ChannelSelection::TopK(-4)), vec![63]);
}

#[test]
fn overlay_keeps_heatmap_size() {
  let frame = gray_frame(224, 200);
  let preset = VizPreset {
    channels: ChannelSelection::TopK(3),
    overlay: true,
    alpha: 0.5,
    ..VizPreset::new("overlay", "wide")
  };
  let rendered = spatial_only(&frame, preset, 64);
  assert_eq!(
    rendered.image.dimensions(),
    (FAKE_SPATIAL as u32, FAKE_SPATIAL as u32)
  );
}

fn irregular_tensor() -> ActivationTensor {
  let data: Vec<f32> = (0..4 * 3 * 5)
    .map(|i| ((i * 37) % 11) as f32 - 4.5)
    .collect();
  ActivationTensor::new("irregular", [1, 4, 3, 5], data).unwrap()
}

#[test]
fn single_channel_reduction_is_identity_for_every_mode() {
  let tensor = irregular_tensor();
  for mode in BlendMode::ALL {
    for c in 0..tensor.channels() {
      assert_eq!(
        reduce(&tensor, &[c], mode),
        tensor.channel(c).unwrap().to_vec(),
        "mode {} channel {}",
        mode,
        c
      );
    }
  }
}

#[test]
fn top_k_with_all_channels_selects_every_channel() {
  let tensor = irregular_tensor();
  let mut selected = select_channels(&tensor, &ChannelSelection::TopK(4));
  selected.sort_unstable();
  assert_eq!(selected, vec![0, 1, 2, 3]);
}

#[test]
fn top_k_with_all_channels_reduces_like_every_channel() {
  let data = vec![1.0, 0.0, 1e8, 0.0, -1e8, 0.0, 0.5, 0.25];
  let tensor = ActivationTensor::new("cancel", [1, 4, 1, 2], data).unwrap();
  let selected = select_channels(&tensor, &ChannelSelection::TopK(4));
  let every: Vec<usize> = (0..tensor.channels()).collect();
  for mode in BlendMode::ALL {
    assert_eq!(
      normalize(&reduce(&tensor, &selected, mode)),
      normalize(&reduce(&tensor, &every, mode)),
      "mode {}",
      mode
    );
  }
}

#[test]
fn normalization_is_idempotent() {
  let tensor = irregular_tensor();
  let once = normalize(&reduce(&tensor, &[0, 1, 2], BlendMode::Sum));
  let again = normalize(&once.iter().map(|&v| f32::from(v)).collect::<Vec<_>>());
  assert_eq!(once, again);
  assert_eq!(once.iter().copied().min(), Some(0));
  assert_eq!(once.iter().copied().max(), Some(255));
}
