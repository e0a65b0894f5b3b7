// 该文件是 Kanjian （看见） 项目的一部分。
// src/task/decoupled.rs - 采集与推理解耦的后台循环
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

//! 生产者/消费者驱动
//!
//! 采集端通过 [`FrameSubmitter`] 把帧放进容量为 1 的帧槽，永不阻塞；
//! 后台线程从帧槽取帧、跑流水线，把结果写进容量为 1 的结果槽，覆盖未被取走的旧结果。
//! 中间帧可能被跳过，只有最新的帧和结果有意义。

use std::{
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::Frame,
  output::Rendered,
  task::{ErrorKind, Pipeline},
};

/// 后台线程取帧的轮询间隔
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
  Idle,
  Running,
  Stopping,
}

/// 帧槽已满时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPolicy {
  /// 用新帧替换槽中未处理的旧帧
  #[default]
  KeepLatest,
  /// 丢弃新帧
  DropIncoming,
}

#[derive(Error, Debug)]
pub enum DecoupledError {
  #[error("后台循环已在运行")]
  AlreadyRunning,
  #[error("无法创建后台线程: {0}")]
  Spawn(#[from] std::io::Error),
}

/// 后台线程因错误退出时留下的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopFailure {
  pub kind: ErrorKind,
  pub message: String,
}

#[derive(Debug, Clone)]
pub struct LoopStatus {
  pub state: LoopState,
  pub processed: u64,
  pub submitted: u64,
  pub dropped: u64,
  pub fps: f64,
  pub last_error: Option<LoopFailure>,
}

#[derive(Default)]
struct Counters {
  /// 已投递但尚未处理完的帧
  in_flight: AtomicUsize,
  submitted: AtomicU64,
  dropped: AtomicU64,
  processed: AtomicU64,
  started: Mutex<Option<Instant>>,
  last_error: Mutex<Option<LoopFailure>>,
}

/// 采集端的投递句柄，可以克隆到采集回调里
#[derive(Clone)]
pub struct FrameSubmitter {
  frame_tx: Sender<Frame>,
  frame_rx: Receiver<Frame>,
  policy: SlotPolicy,
  counters: Arc<Counters>,
}

impl FrameSubmitter {
  /// 投递一帧，返回该帧是否进入了帧槽
  pub fn submit(&self, mut frame: Frame) -> bool {
    let counters = &self.counters;
    counters.submitted.fetch_add(1, Ordering::Relaxed);
    counters.in_flight.fetch_add(1, Ordering::AcqRel);

    loop {
      frame = match self.frame_tx.try_send(frame) {
        Ok(()) => return true,
        Err(TrySendError::Full(frame)) => frame,
        Err(TrySendError::Disconnected(_)) => {
          counters.in_flight.fetch_sub(1, Ordering::AcqRel);
          return false;
        }
      };
      if self.policy == SlotPolicy::DropIncoming {
        break;
      }
      // 槽里的旧帧可能已被工作线程取走，此时直接重试投递
      if self.frame_rx.try_recv().is_ok() {
        counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        debug!("帧槽已满，替换旧帧");
      }
    }

    counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    counters.dropped.fetch_add(1, Ordering::Relaxed);
    debug!("帧槽已满，丢弃新帧");
    false
  }
}

struct Worker {
  handle: JoinHandle<()>,
  running: Arc<AtomicBool>,
}

/// 后台推理循环：`Idle → Running → Stopping → Idle`
pub struct DecoupledLoop {
  pipeline: Arc<Mutex<Pipeline>>,
  submitter: FrameSubmitter,
  result_tx: Sender<Rendered>,
  result_rx: Receiver<Rendered>,
  worker: Option<Worker>,
  join_timeout: Duration,
}

impl DecoupledLoop {
  pub fn new(pipeline: Pipeline) -> Self {
    let (frame_tx, frame_rx) = bounded(1);
    let (result_tx, result_rx) = bounded(1);
    Self {
      pipeline: Arc::new(Mutex::new(pipeline)),
      submitter: FrameSubmitter {
        frame_tx,
        frame_rx,
        policy: SlotPolicy::default(),
        counters: Arc::new(Counters::default()),
      },
      result_tx,
      result_rx,
      worker: None,
      join_timeout: DEFAULT_JOIN_TIMEOUT,
    }
  }

  pub fn with_policy(mut self, policy: SlotPolicy) -> Self {
    self.submitter.policy = policy;
    self
  }

  pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
    self.join_timeout = timeout;
    self
  }

  pub fn submitter(&self) -> FrameSubmitter {
    self.submitter.clone()
  }

  /// 在两帧之间修改流水线，例如切换预设
  pub fn with_pipeline<T>(&self, f: impl FnOnce(&mut Pipeline) -> T) -> T {
    let mut pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut pipeline)
  }

  pub fn start(&mut self) -> Result<(), DecoupledError> {
    if self.worker.is_some() {
      match self.state() {
        LoopState::Idle => self.reap(),
        _ => return Err(DecoupledError::AlreadyRunning),
      }
    }

    let running = Arc::new(AtomicBool::new(true));
    let counters = self.submitter.counters.clone();
    *counters.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    *counters.started.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    counters.processed.store(0, Ordering::Release);

    let context = WorkerContext {
      running: running.clone(),
      pipeline: self.pipeline.clone(),
      frame_rx: self.submitter.frame_rx.clone(),
      result_tx: self.result_tx.clone(),
      result_rx: self.result_rx.clone(),
      counters,
    };
    let handle = thread::Builder::new()
      .name("kanjian-worker".to_string())
      .spawn(move || context.run())?;

    info!("后台推理循环已启动");
    self.worker = Some(Worker { handle, running });
    Ok(())
  }

  /// 通知后台线程退出，并在限定时间内等待它结束
  pub fn stop(&mut self) {
    let Some(worker) = self.worker.take() else {
      return;
    };
    worker.running.store(false, Ordering::Release);

    let deadline = Instant::now() + self.join_timeout;
    while !worker.handle.is_finished() && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
    }
    if worker.handle.is_finished() {
      if worker.handle.join().is_err() {
        error!("后台推理线程异常退出");
      }
      info!("后台推理循环已停止");
    } else {
      warn!("等待后台推理线程超时 ({:?})，不再等待", self.join_timeout);
    }
  }

  fn reap(&mut self) {
    if let Some(worker) = self.worker.take()
      && worker.handle.join().is_err()
    {
      error!("后台推理线程异常退出");
    }
  }

  pub fn state(&self) -> LoopState {
    match &self.worker {
      None => LoopState::Idle,
      Some(worker) if worker.running.load(Ordering::Acquire) => LoopState::Running,
      Some(worker) if worker.handle.is_finished() => LoopState::Idle,
      Some(_) => LoopState::Stopping,
    }
  }

  pub fn status(&self) -> LoopStatus {
    let counters = &self.submitter.counters;
    let processed = counters.processed.load(Ordering::Acquire);
    let elapsed = counters
      .started
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .map(|started| started.elapsed().as_secs_f64())
      .unwrap_or(0.0);
    LoopStatus {
      state: self.state(),
      processed,
      submitted: counters.submitted.load(Ordering::Relaxed),
      dropped: counters.dropped.load(Ordering::Relaxed),
      fps: if elapsed > 0.0 {
        processed as f64 / elapsed
      } else {
        0.0
      },
      last_error: counters
        .last_error
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone(),
    }
  }

  pub fn fps(&self) -> f64 {
    self.status().fps
  }

  pub fn last_error(&self) -> Option<LoopFailure> {
    self.status().last_error
  }

  /// 取走最新的结果；没有新结果时返回 `None`
  pub fn latest_result(&self) -> Option<Rendered> {
    self.result_rx.try_recv().ok()
  }

  /// 等到所有已投递的帧都处理完，超时返回 `false`
  pub fn wait_idle(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      if self.submitter.counters.in_flight.load(Ordering::Acquire) == 0 {
        return true;
      }
      if Instant::now() >= deadline {
        return false;
      }
      thread::sleep(Duration::from_millis(5));
    }
  }
}

impl Drop for DecoupledLoop {
  fn drop(&mut self) {
    self.stop();
  }
}

struct WorkerContext {
  running: Arc<AtomicBool>,
  pipeline: Arc<Mutex<Pipeline>>,
  frame_rx: Receiver<Frame>,
  result_tx: Sender<Rendered>,
  result_rx: Receiver<Rendered>,
  counters: Arc<Counters>,
}

impl WorkerContext {
  fn run(self) {
    while self.running.load(Ordering::Acquire) {
      let frame = match self.frame_rx.recv_timeout(POLL_INTERVAL) {
        Ok(frame) => frame,
        Err(RecvTimeoutError::Timeout) => continue,
        Err(RecvTimeoutError::Disconnected) => break,
      };
      if !self.running.load(Ordering::Acquire) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        break;
      }

      let result = self
        .pipeline
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .process(&frame);
      match result {
        Ok(rendered) => {
          self.publish(rendered);
          self.counters.processed.fetch_add(1, Ordering::AcqRel);
          self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        Err(e) => {
          error!("后台流水线失败，停止循环: {}", e);
          *self
            .counters
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(LoopFailure {
            kind: e.kind(),
            message: e.to_string(),
          });
          self.running.store(false, Ordering::Release);
          self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
          break;
        }
      }
    }
    debug!("后台推理线程退出");
  }

  /// 写入结果槽，覆盖尚未被取走的旧结果
  fn publish(&self, mut rendered: Rendered) {
    loop {
      match self.result_tx.try_send(rendered) {
        Ok(()) => return,
        Err(TrySendError::Full(back)) => {
          rendered = back;
          match self.result_rx.try_recv() {
            Ok(_) | Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return,
          }
        }
        Err(TrySendError::Disconnected(_)) => return,
      }
    }
  }
}
