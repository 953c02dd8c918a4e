use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Client protection knobs. Format-agnostic (TOML, JSON, YAML via serde);
/// duration fields deserialize from strings like `"500ms"` or `"5s"`.
///
/// The client itself never reads files or environment variables; the demo
/// binary loads a `[client]` TOML section and passes the result to
/// [`ClientBuilder::config`](crate::ClientBuilder::config).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Hard cap on concurrent in-flight requests.
    pub max_in_flight: usize,

    /// Wait-queue capacity. 0 disables queueing: the limiter rejects as soon
    /// as `max_in_flight` is reached.
    pub max_queue: usize,

    /// How long a request may wait in the queue before being rejected.
    #[serde(deserialize_with = "duration_from_str")]
    pub enqueue_timeout: Duration,

    /// Hard deadline for one outbound exchange, connect through body read.
    #[serde(deserialize_with = "duration_from_str")]
    pub request_timeout: Duration,

    pub breaker: BreakerConfig,
}

/// Per-upstream circuit breaker tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of outcomes in the rolling window.
    pub window_size: usize,

    /// Minimum observed outcomes before the failure rate can trip the
    /// breaker.
    pub min_requests: usize,

    /// Failure rate (0.0..=1.0) at or above which the breaker opens.
    pub failure_threshold: f64,

    /// How long an open circuit stays open before the next request is
    /// allowed through as a half-open probe.
    #[serde(deserialize_with = "duration_from_str")]
    pub cooldown: Duration,

    /// Concurrent probes admitted while half-open, and the number of probe
    /// successes required to close the circuit.
    pub half_open_probe_count: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 32,
            max_queue: 128,
            enqueue_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            breaker: BreakerConfig::default(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            min_requests: 20,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(5),
            half_open_probe_count: 3,
        }
    }
}

impl ClientConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::MaxInFlight);
        }
        if self.enqueue_timeout.is_zero() {
            return Err(ConfigError::EnqueueTimeout);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::RequestTimeout);
        }
        self.breaker.validate()
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::WindowSize);
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(ConfigError::FailureThreshold(self.failure_threshold));
        }
        if self.cooldown.is_zero() {
            return Err(ConfigError::Cooldown);
        }
        if self.half_open_probe_count == 0 {
            return Err(ConfigError::HalfOpenProbeCount);
        }
        Ok(())
    }
}

/// Parse a duration with a unit suffix, e.g. `"250ms"` or `"1.5s"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    // Longest suffix first so "ms" is not read as a number ending in "s".
    const UNITS: [(&str, f64); 2] = [("ms", 1e-3), ("s", 1.0)];

    let s = s.trim();
    let (suffix, scale) = UNITS
        .iter()
        .find(|(suffix, _)| s.ends_with(suffix))
        .ok_or_else(|| format!("duration '{s}' needs a unit suffix (ms or s)"))?;
    let number = &s[..s.len() - suffix.len()];
    let value: f64 = number
        .parse()
        .map_err(|_| format!("unparseable number '{number}' in duration '{s}'"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("duration '{s}' is out of range"));
    }
    Ok(Duration::from_secs_f64(value * scale))
}

fn duration_from_str<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}
