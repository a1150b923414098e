use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default write and read durations, matching the classic 500ms ping interval.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Measurement mode. Ping is the degenerate single-row case of traceroute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Ping,
    Traceroute,
}

/// Runtime configuration for a measurement session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Target host: a literal IPv4 address or a hostname resolved at run.
    pub target: String,
    pub mode: Mode,
    /// Number of TTL rows to probe. Always 1 in ping mode.
    pub max_ttl: u8,
    /// Probes per TTL row.
    pub count: u16,
    /// Socket write timeout applied to outgoing probes.
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,
    /// Per-probe reply deadline, also the pacing interval within a row.
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,
}

impl SessionConfig {
    /// Ping configuration with the default 500ms durations.
    pub fn ping(target: impl Into<String>, count: u16) -> Self {
        Self::ping_with(target, count, DEFAULT_TIMEOUT, DEFAULT_TIMEOUT)
    }

    /// Ping configuration with explicit write and read durations.
    pub fn ping_with(
        target: impl Into<String>,
        count: u16,
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            target: target.into(),
            mode: Mode::Ping,
            max_ttl: 1,
            count,
            write_timeout,
            read_timeout,
        }
    }

    /// Traceroute configuration with the default 500ms durations.
    pub fn traceroute(target: impl Into<String>, max_ttl: u8, count: u16) -> Self {
        Self::traceroute_with(target, max_ttl, count, DEFAULT_TIMEOUT, DEFAULT_TIMEOUT)
    }

    /// Traceroute configuration with explicit write and read durations.
    pub fn traceroute_with(
        target: impl Into<String>,
        max_ttl: u8,
        count: u16,
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            target: target.into(),
            mode: Mode::Traceroute,
            max_ttl,
            count,
            write_timeout,
            read_timeout,
        }
    }
}

/// Serde helper for Duration
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
