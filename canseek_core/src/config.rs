use crate::bruteforce::DEFAULT_SOURCE_ADDRESS;
use crate::localizer::{LocalizerSettings, DEFAULT_RETRY_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TimingSettings {
    #[serde(default = "default_signal_delay_ms")]
    pub signal_delay_ms: u64,
    #[serde(default = "default_repeat_delay_ms")]
    pub repeat_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_threshold")]
    pub retry_threshold: u32,
}

fn default_signal_delay_ms() -> u64 {
    250
}
fn default_repeat_delay_ms() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    1
}
fn default_retry_threshold() -> u32 {
    DEFAULT_RETRY_THRESHOLD
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            signal_delay_ms: default_signal_delay_ms(),
            repeat_delay_ms: default_repeat_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_threshold: default_retry_threshold(),
        }
    }
}

impl TimingSettings {
    pub fn localizer(&self) -> LocalizerSettings {
        LocalizerSettings {
            signal_delay: Duration::from_millis(self.signal_delay_ms),
            repeat_delay: Duration::from_millis(self.repeat_delay_ms),
            retry_threshold: self.retry_threshold,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SensorSettings {
    /// Argument vector run per reading; `{channel}` is replaced by the channel index.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_channels")]
    pub channels: usize,
    pub calibration_file: Option<PathBuf>,
}

fn default_channels() -> usize {
    1
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            channels: default_channels(),
            calibration_file: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TransportSettings {
    /// Argument vector run per frame; `{frame}`, `{id}` and `{data}` are substituted.
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ScanConfig {
    #[serde(default = "default_history_latency_ms")]
    pub history_latency_ms: u64,
    #[serde(default = "default_source_address")]
    pub default_source_address: u8,
}

fn default_history_latency_ms() -> u64 {
    500
}
fn default_source_address() -> u8 {
    DEFAULT_SOURCE_ADDRESS
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            history_latency_ms: default_history_latency_ms(),
            default_source_address: default_source_address(),
        }
    }
}

impl ScanConfig {
    pub fn history_latency(&self) -> Duration {
        Duration::from_millis(self.history_latency_ms)
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub sensor: SensorSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub scan: ScanConfig,
}

impl SessionConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SessionConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
