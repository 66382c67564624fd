//! Client configuration: gateway endpoint, timing ceilings, retry pacing.
//!
//! [`PlatformConfig`] is plain data with working defaults; everything can be
//! overridden in code or loaded from a TOML file where durations are spelled
//! in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::communication::{
    EventConfig, GatewayConfig, ReconnectPolicy, RetryConfig, TransferConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid gateway address {addr:?}: {detail}")]
    InvalidGateway { addr: String, detail: String },

    #[error("invalid value for {field}: {detail}")]
    InvalidValue { field: &'static str, detail: String },
}

/// Everything the client needs to reach and pace the platform.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Gateway endpoint as `host:port`.
    pub gateway: String,
    /// Ceiling on a single connection attempt.
    pub connect_timeout: Duration,
    /// Ceiling on one control round trip.
    pub request_timeout: Duration,
    /// Default ceiling for a whole invocation; a per-request timeout wins.
    pub invoke_ceiling: Duration,
    /// Ceiling for model registration including asset uploads.
    pub registration_ceiling: Duration,
    /// Status poll cadence while the event feed is degraded.
    pub poll_interval: Duration,
    /// How long a cancel waits for platform acknowledgment before going
    /// fire-and-forget.
    pub cancel_grace: Duration,
    pub retry: RetryConfig,
    pub transfer: TransferConfig,
    pub events: EventConfig,
    pub reconnect: ReconnectPolicy,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            gateway: "127.0.0.1:7700".into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            invoke_ceiling: Duration::from_secs(15 * 60),
            registration_ceiling: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(2),
            cancel_grace: Duration::from_secs(5),
            retry: RetryConfig::default(),
            transfer: TransferConfig::default(),
            events: EventConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl PlatformConfig {
    pub fn for_gateway(addr: impl Into<String>) -> Self {
        Self {
            gateway: addr.into(),
            ..Self::default()
        }
    }

    /// Load a TOML file and overlay it on the defaults.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Malformed {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::default();
        file.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_invoke_ceiling(mut self, ceiling: Duration) -> Self {
        self.invoke_ceiling = ceiling;
        self
    }

    pub fn with_events(mut self, events: EventConfig) -> Self {
        self.events = events;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Gateway settings for opening links under this configuration.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::new(self.gateway.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_reconnect_policy(self.reconnect.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (host, port) =
            self.gateway
                .rsplit_once(':')
                .ok_or_else(|| ConfigError::InvalidGateway {
                    addr: self.gateway.clone(),
                    detail: "expected host:port".into(),
                })?;
        if host.is_empty() {
            return Err(ConfigError::InvalidGateway {
                addr: self.gateway.clone(),
                detail: "empty host".into(),
            });
        }
        if port.parse::<u16>().is_err() {
            return Err(ConfigError::InvalidGateway {
                addr: self.gateway.clone(),
                detail: format!("bad port {port:?}"),
            });
        }
        for (field, value) in [
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
            ("invoke_ceiling", self.invoke_ceiling),
            ("registration_ceiling", self.registration_ceiling),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    detail: "must be greater than zero".into(),
                });
            }
        }
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transfer.chunk_size",
                detail: "must be greater than zero".into(),
            });
        }
        if self.transfer.window == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transfer.window",
                detail: "must be greater than zero".into(),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoff_multiplier",
                detail: "must be at least 1.0".into(),
            });
        }
        Ok(())
    }
}

/// TOML shadow of [`PlatformConfig`]; absent fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    gateway: Option<String>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    invoke_ceiling_ms: Option<u64>,
    registration_ceiling_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    cancel_grace_ms: Option<u64>,
    retry: Option<FileRetry>,
    transfer: Option<FileTransfer>,
    events: Option<FileEvents>,
    reconnect: Option<FileReconnect>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRetry {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    jitter_factor: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTransfer {
    chunk_size: Option<usize>,
    window: Option<usize>,
    ack_timeout_ms: Option<u64>,
    max_chunk_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileEvents {
    enabled: Option<bool>,
    idle_timeout_ms: Option<u64>,
    max_reconnect_failures: Option<u32>,
    degraded_retry_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
enum FileReconnect {
    None,
    FixedInterval {
        delay_ms: u64,
        max_attempts: Option<u32>,
    },
    ExponentialBackoff {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        max_attempts: Option<u32>,
    },
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl FileConfig {
    fn apply(self, config: &mut PlatformConfig) {
        if let Some(gateway) = self.gateway {
            config.gateway = gateway;
        }
        if let Some(v) = self.connect_timeout_ms {
            config.connect_timeout = ms(v);
        }
        if let Some(v) = self.request_timeout_ms {
            config.request_timeout = ms(v);
        }
        if let Some(v) = self.invoke_ceiling_ms {
            config.invoke_ceiling = ms(v);
        }
        if let Some(v) = self.registration_ceiling_ms {
            config.registration_ceiling = ms(v);
        }
        if let Some(v) = self.poll_interval_ms {
            config.poll_interval = ms(v);
        }
        if let Some(v) = self.cancel_grace_ms {
            config.cancel_grace = ms(v);
        }
        if let Some(retry) = self.retry {
            if let Some(v) = retry.max_attempts {
                config.retry.max_attempts = v;
            }
            if let Some(v) = retry.base_delay_ms {
                config.retry.base_delay = ms(v);
            }
            if let Some(v) = retry.max_delay_ms {
                config.retry.max_delay = ms(v);
            }
            if let Some(v) = retry.backoff_multiplier {
                config.retry.backoff_multiplier = v;
            }
            if let Some(v) = retry.jitter_factor {
                config.retry.jitter_factor = v;
            }
        }
        if let Some(transfer) = self.transfer {
            if let Some(v) = transfer.chunk_size {
                config.transfer.chunk_size = v;
            }
            if let Some(v) = transfer.window {
                config.transfer.window = v;
            }
            if let Some(v) = transfer.ack_timeout_ms {
                config.transfer.ack_timeout = ms(v);
            }
            if let Some(v) = transfer.max_chunk_retries {
                config.transfer.max_chunk_retries = v;
            }
        }
        if let Some(events) = self.events {
            if let Some(v) = events.enabled {
                config.events.enabled = v;
            }
            if let Some(v) = events.idle_timeout_ms {
                config.events.idle_timeout = ms(v);
            }
            if let Some(v) = events.max_reconnect_failures {
                config.events.max_reconnect_failures = v;
            }
            if let Some(v) = events.degraded_retry_interval_ms {
                config.events.degraded_retry_interval = ms(v);
            }
        }
        if let Some(reconnect) = self.reconnect {
            config.reconnect = match reconnect {
                FileReconnect::None => ReconnectPolicy::None,
                FileReconnect::FixedInterval {
                    delay_ms,
                    max_attempts,
                } => ReconnectPolicy::FixedInterval {
                    delay: ms(delay_ms),
                    max_attempts,
                },
                FileReconnect::ExponentialBackoff {
                    initial_delay_ms,
                    max_delay_ms,
                    multiplier,
                    max_attempts,
                } => ReconnectPolicy::ExponentialBackoff {
                    initial_delay: ms(initial_delay_ms),
                    max_delay: ms(max_delay_ms),
                    multiplier,
                    max_attempts,
                },
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_pass_validation() {
        PlatformConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults_elsewhere() {
        let file = write_config(
            r#"
            gateway = "models.example.net:9100"
            request_timeout_ms = 10000

            [transfer]
            chunk_size = 65536
            "#,
        );
        let config = PlatformConfig::from_toml_path(file.path()).unwrap();
        assert_eq!(config.gateway, "models.example.net:9100");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.transfer.chunk_size, 65536);
        // untouched knobs stay at their defaults
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.transfer.window, 10);
    }

    #[test]
    fn reconnect_policy_parses_from_table() {
        let file = write_config(
            r#"
            [reconnect]
            kind = "fixed_interval"
            delay_ms = 250
            max_attempts = 4
            "#,
        );
        let config = PlatformConfig::from_toml_path(file.path()).unwrap();
        assert!(matches!(
            config.reconnect,
            ReconnectPolicy::FixedInterval {
                delay,
                max_attempts: Some(4),
            } if delay == Duration::from_millis(250)
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config("gatway = \"typo.example:1\"\n");
        assert!(matches!(
            PlatformConfig::from_toml_path(file.path()),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn gateway_shape_is_checked() {
        let mut config = PlatformConfig::default();
        config.gateway = "no-port".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGateway { .. })
        ));

        config.gateway = "host:notaport".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGateway { .. })
        ));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let mut config = PlatformConfig::default();
        config.poll_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "poll_interval", .. })
        ));
    }
}
