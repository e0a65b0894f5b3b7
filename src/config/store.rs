// 该文件是 Kanjian （看见） 项目的一部分。
// src/config/store.rs - 配置文件读写
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
  ffi::OsString,
  fs::{self, File, OpenOptions, TryLockError},
  io::Write,
  path::{Path, PathBuf},
  thread,
  time::{Duration, Instant},
};

use tracing::{error, info, warn};

use crate::config::{ConfigError, Settings, migrations};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// JSON 配置文件
///
/// 读取从不写盘；保存时先加独占锁，备份旧文件，写入失败则从备份恢复。
#[derive(Debug, Clone)]
pub struct SettingsStore {
  path: PathBuf,
  lock_timeout: Duration,
}

/// 持有期间独占配置文件锁
struct LockGuard(File);

impl Drop for LockGuard {
  fn drop(&mut self) {
    let _ = self.0.unlock();
  }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
  let mut name: OsString = path.as_os_str().to_owned();
  name.push(suffix);
  PathBuf::from(name)
}

impl SettingsStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      lock_timeout: DEFAULT_LOCK_TIMEOUT,
    }
  }

  pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
    self.lock_timeout = timeout;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn lock_path(&self) -> PathBuf {
    with_suffix(&self.path, ".lock")
  }

  pub fn backup_path(&self) -> PathBuf {
    with_suffix(&self.path, ".bak")
  }

  /// 读取并迁移配置；文件缺失或损坏时返回内置默认配置
  pub fn load(&self) -> Settings {
    if !self.path.exists() {
      info!("配置文件 {} 不存在，使用默认配置", self.path.display());
      return Settings::default();
    }
    match self.try_load() {
      Ok(settings) => settings,
      Err(e) => {
        warn!(
          "配置文件 {} 无法解析，使用默认配置: {}",
          self.path.display(),
          e
        );
        Settings::default()
      }
    }
  }

  fn try_load(&self) -> Result<Settings, ConfigError> {
    let text = fs::read_to_string(&self.path)?;
    let raw: serde_json::Value = serde_json::from_str(&text)?;
    let settings = serde_json::from_value(migrations::migrate(raw))?;
    Ok(settings)
  }

  pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
    let data = serde_json::to_string_pretty(settings)?;
    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::create_dir_all(parent)?;
    }

    let _lock = self.acquire_lock()?;
    let backup = self.backup_path();
    let has_backup = if self.path.exists() {
      fs::copy(&self.path, &backup)?;
      true
    } else {
      false
    };

    if let Err(e) = self.write(data.as_bytes()) {
      error!("写入配置文件 {} 失败: {}", self.path.display(), e);
      if has_backup {
        if let Err(restore) = fs::copy(&backup, &self.path) {
          error!("从备份恢复配置失败: {}", restore);
        }
      }
      return Err(e.into());
    }

    info!("配置已保存到 {}", self.path.display());
    Ok(())
  }

  fn write(&self, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(&self.path)?;
    file.write_all(data)?;
    file.write_all(b"\n")?;
    file.sync_all()
  }

  fn acquire_lock(&self) -> Result<LockGuard, ConfigError> {
    let file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .write(true)
      .open(self.lock_path())?;

    let start = Instant::now();
    loop {
      match file.try_lock() {
        Ok(()) => return Ok(LockGuard(file)),
        Err(TryLockError::WouldBlock) => {
          if start.elapsed() >= self.lock_timeout {
            error!("等待配置文件锁超时 ({:?})", self.lock_timeout);
            return Err(ConfigError::LockTimeout(self.lock_timeout));
          }
          thread::sleep(LOCK_POLL_INTERVAL);
        }
        Err(TryLockError::Error(e)) => return Err(e.into()),
      }
    }
  }
}
