use std::time::Duration;

use serde::Deserialize;

use crate::apn::types::RadioTech;
use crate::error::{DataError, Result};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataConfigInput {
    pub version: u32,
    pub retry: RetryConfigInput,
    pub monitor: MonitorConfigInput,
    pub timing: TimingConfigInput,
    pub features: FeatureConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfigInput {
    pub default_setup_fail_delay_ms: Option<u64>,
    pub default_modem_dend_delay_ms: Option<u64>,
    pub internal_default_delay_ms: Option<u64>,
    pub other_delay_ms: Option<u64>,
    pub max_jitter_ms: Option<u64>,
    pub max_try_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorConfigInput {
    pub stall_period_ms: Option<u64>,
    pub statistics_period_ms: Option<u64>,
    pub recovery_trigger_packets: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimingConfigInput {
    pub establish_delay_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    /// `0` disables the deactivation watchdog.
    pub disconnect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureConfigInput {
    pub in_call_switch: Option<bool>,
    pub single_connection_rats: Vec<RadioTech>,
    pub multiple_connections_enabled: Option<bool>,
}

/// Tiered retry delays. See [`RetryPolicy`](crate::retry::RetryPolicy).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub default_setup_fail_delay: Duration,
    pub default_modem_dend_delay: Duration,
    pub internal_default_delay: Duration,
    pub other_delay: Duration,
    pub max_jitter: Duration,
    /// Attempts per candidate before the cursor moves on. Never zero.
    pub max_try_count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_setup_fail_delay: Duration::from_millis(3000),
            default_modem_dend_delay: Duration::from_millis(1000),
            internal_default_delay: Duration::from_millis(30_000),
            other_delay: Duration::from_millis(2000),
            max_jitter: Duration::from_millis(2000),
            max_try_count: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub stall_period: Duration,
    pub statistics_period: Duration,
    /// Sent-without-receive packets before the recovery ladder advances.
    pub recovery_trigger_packets: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stall_period: Duration::from_secs(10),
            statistics_period: Duration::from_secs(3),
            recovery_trigger_packets: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimingConfig {
    pub establish_delay: Duration,
    /// Activation watchdog. `None` trusts the modem to always answer.
    pub connect_timeout: Option<Duration>,
    /// Deactivation watchdog; a context whose teardown is never answered
    /// is released after this long.
    pub disconnect_timeout: Option<Duration>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            establish_delay: Duration::from_millis(
                crate::apn::types::ESTABLISH_DATA_CONNECTION_DELAY_MS,
            ),
            connect_timeout: None,
            disconnect_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    pub in_call_switch: bool,
    /// RATs on which the modem supports a single context only.
    pub single_connection_rats: Vec<RadioTech>,
    pub multiple_connections_enabled: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            in_call_switch: false,
            single_connection_rats: Vec::new(),
            multiple_connections_enabled: true,
        }
    }
}

impl FeatureConfig {
    pub fn is_single_connection(&self, rat: RadioTech) -> bool {
        !self.multiple_connections_enabled || self.single_connection_rats.contains(&rat)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataConfig {
    pub version: u32,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
    pub timing: TimingConfig,
    pub features: FeatureConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
            timing: TimingConfig::default(),
            features: FeatureConfig::default(),
        }
    }
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl DataConfigInput {
    pub fn resolve(self) -> Result<DataConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(DataError::UnsupportedVersion(version));
        }

        let d = RetryConfig::default();
        let retry = RetryConfig {
            default_setup_fail_delay: ms_or(
                self.retry.default_setup_fail_delay_ms,
                d.default_setup_fail_delay,
            ),
            default_modem_dend_delay: ms_or(
                self.retry.default_modem_dend_delay_ms,
                d.default_modem_dend_delay,
            ),
            internal_default_delay: ms_or(self.retry.internal_default_delay_ms, d.internal_default_delay),
            other_delay: ms_or(self.retry.other_delay_ms, d.other_delay),
            max_jitter: ms_or(self.retry.max_jitter_ms, d.max_jitter),
            max_try_count: self.retry.max_try_count.unwrap_or(d.max_try_count).max(1),
        };

        let d = MonitorConfig::default();
        let stall_period = ms_or(self.monitor.stall_period_ms, d.stall_period);
        if stall_period.is_zero() {
            return Err(DataError::InvalidConfig(
                "monitor.stall_period_ms must be positive".into(),
            ));
        }
        let monitor = MonitorConfig {
            stall_period,
            statistics_period: ms_or(self.monitor.statistics_period_ms, d.statistics_period),
            recovery_trigger_packets: self
                .monitor
                .recovery_trigger_packets
                .unwrap_or(d.recovery_trigger_packets)
                .max(1),
        };

        let d = TimingConfig::default();
        let timing = TimingConfig {
            establish_delay: ms_or(self.timing.establish_delay_ms, d.establish_delay),
            connect_timeout: self
                .timing
                .connect_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            disconnect_timeout: match self.timing.disconnect_timeout_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => d.disconnect_timeout,
            },
        };

        let d = FeatureConfig::default();
        let features = FeatureConfig {
            in_call_switch: self.features.in_call_switch.unwrap_or(d.in_call_switch),
            single_connection_rats: self.features.single_connection_rats,
            multiple_connections_enabled: self
                .features
                .multiple_connections_enabled
                .unwrap_or(d.multiple_connections_enabled),
        };

        Ok(DataConfig {
            version,
            retry,
            monitor,
            timing,
            features,
        })
    }
}

impl DataConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(DataConfig::default());
        }
        let parsed: DataConfigInput = toml::from_str(input)
            .map_err(|e| DataError::InvalidConfig(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }
}
