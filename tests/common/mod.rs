#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

pub use kanjian::{
  config::{BlendMode, ChannelSelection, VizPreset},
  frame::Frame,
  model::{ActivationTensor, InferenceEngine, LayerSpec, ModelDescriptor},
  output::{ColorMap, LatestImage},
  task::{ErrorKind, Pipeline},
};
