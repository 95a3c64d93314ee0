//! Control-plane configuration stored in `conduct.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::backend::process::ProcessTimeouts;
use crate::pause::PauseListenerConfig;
use crate::sim::SimConfig;

/// Control-plane configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlConfig {
    pub ipc: IpcConfig,
    pub listener: ListenerConfig,
    pub conversation: ConversationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IpcConfig {
    /// Per-command round-trip timeout in seconds. A timeout means the
    /// command's outcome is unknown, not that it failed.
    pub call_timeout_secs: u64,

    /// How long to wait for the worker's readiness report.
    pub startup_timeout_secs: u64,

    /// Join timeout after a cooperative shutdown command.
    pub shutdown_timeout_secs: u64,

    /// Join timeout after SIGTERM, before escalating to SIGKILL.
    pub terminate_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenerConfig {
    /// A second Ctrl-C within this window terminates the session.
    pub double_interrupt_window_ms: u64,

    /// Keyboard poll interval for the listener thread.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConversationConfig {
    /// Step budget for a single run call.
    pub max_iterations_per_run: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 5,
            startup_timeout_secs: 10,
            shutdown_timeout_secs: 2,
            terminate_timeout_secs: 1,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            double_interrupt_window_ms: 2000,
            poll_interval_ms: 100,
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_iterations_per_run: 8,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            ipc: IpcConfig::default(),
            listener: ListenerConfig::default(),
            conversation: ConversationConfig::default(),
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ipc.call_timeout_secs == 0 {
            return Err(anyhow!("ipc.call_timeout_secs must be > 0"));
        }
        if self.ipc.startup_timeout_secs == 0 {
            return Err(anyhow!("ipc.startup_timeout_secs must be > 0"));
        }
        if self.ipc.shutdown_timeout_secs == 0 {
            return Err(anyhow!("ipc.shutdown_timeout_secs must be > 0"));
        }
        if self.ipc.terminate_timeout_secs == 0 {
            return Err(anyhow!("ipc.terminate_timeout_secs must be > 0"));
        }
        if self.listener.double_interrupt_window_ms == 0 {
            return Err(anyhow!("listener.double_interrupt_window_ms must be > 0"));
        }
        if self.listener.poll_interval_ms == 0 {
            return Err(anyhow!("listener.poll_interval_ms must be > 0"));
        }
        if self.conversation.max_iterations_per_run == 0 {
            return Err(anyhow!("conversation.max_iterations_per_run must be > 0"));
        }
        Ok(())
    }

    pub fn process_timeouts(&self) -> ProcessTimeouts {
        ProcessTimeouts {
            startup: Duration::from_secs(self.ipc.startup_timeout_secs),
            call: Duration::from_secs(self.ipc.call_timeout_secs),
            shutdown: Duration::from_secs(self.ipc.shutdown_timeout_secs),
            terminate: Duration::from_secs(self.ipc.terminate_timeout_secs),
        }
    }

    pub fn listener_config(&self) -> PauseListenerConfig {
        PauseListenerConfig {
            double_interrupt_window: Duration::from_millis(self.listener.double_interrupt_window_ms),
            poll_interval: Duration::from_millis(self.listener.poll_interval_ms),
        }
    }

    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            max_iterations_per_run: self.conversation.max_iterations_per_run,
            ..SimConfig::default()
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ControlConfig::default()`.
pub fn load_config(path: &Path) -> Result<ControlConfig> {
    if !path.exists() {
        let cfg = ControlConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ControlConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ControlConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
