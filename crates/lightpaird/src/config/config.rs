use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;

use super::diagnostics::{
    format_diagnostics, ConfigError, Diagnostic, Error, ValidationError, Warning,
};
use super::partial::{
    PartialApiConfig, PartialConfig, PartialMqttConfig, PartialPairing, PartialReachabilityConfig,
};
use crate::pairing::config::DEFAULT_BRIGHTNESS_ON_SWITCH;
use crate::pairing::{DeviceId, PairingForm, PairingId, WaitPolicy};

#[derive(Debug, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    /// Absent when no `[mqtt]` section is configured; the MQTT integration
    /// is then not started.
    pub mqtt: Option<MqttConfig>,
    pub reachability: ReachabilityConfig,
    /// Pairings to create at startup, keyed by id.
    pub pairings: BTreeMap<PairingId, PairingForm>,
}

// LogLevel needs Deserialize because it's used in PartialLoggingConfig with toml::Spanned
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"lightpaird::integrations" = "debug"`
    pub overrides: HashMap<String, LogLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub listen: IpAddr,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: IpAddr::from([127, 0, 0, 1]),
            port: 8566,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub discovery_prefix: String,
    pub keep_alive_s: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Tunables for waiting on the smart device after the physical one is
/// powered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReachabilityConfig {
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub backoff: f64,
    pub timeout_s: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_poll_interval_ms: 5000,
            backoff: 2.0,
            timeout_s: 60,
        }
    }
}

impl ReachabilityConfig {
    pub fn to_wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_interval: Duration::from_millis(self.max_poll_interval_ms),
            backoff: self.backoff,
            timeout: Duration::from_secs(self.timeout_s),
        }
    }
}

impl Config {
    /// Load configuration from multiple TOML files with import resolution
    ///
    /// Supports several files (e.g. base + secrets), import statements within
    /// files, conflict detection across all sources and validation with all
    /// errors and warnings reported together.
    ///
    /// Returns Ok((Config, diagnostics)) where diagnostics only holds warnings.
    pub fn from_files(paths: &[PathBuf]) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        // Load all configs
        let configs = PartialConfig::load_with_imports(paths)?;

        // Merge with first-wins semantics, collecting diagnostics
        let (partial, diagnostics) = PartialConfig::merge(configs);

        // Convert to Config and validate, combining all diagnostics
        Self::from_partial(partial, diagnostics)
    }

    /// Convert a PartialConfig to a Config, validating all fields
    ///
    /// Takes diagnostics from the merge step and adds validation diagnostics.
    pub fn from_partial(
        partial: PartialConfig,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let mut errors = Vec::new();

        let logging = if let Some(partial_logging) = partial.logging {
            LoggingConfig {
                level: partial_logging
                    .level
                    .map(|s| *s.get_ref())
                    .unwrap_or_default(),
                overrides: partial_logging
                    .overrides
                    .map(|hm| hm.into_iter().map(|(k, v)| (k, *v.get_ref())).collect())
                    .unwrap_or_default(),
            }
        } else {
            LoggingConfig::default()
        };

        let api = Self::validate_api(partial.api.unwrap_or_default(), &mut errors);
        let mqtt = partial
            .mqtt
            .and_then(|m| Self::validate_mqtt(m, &mut errors));
        let reachability =
            Self::validate_reachability(partial.reachability.unwrap_or_default(), &mut errors);

        let mut pairings = BTreeMap::new();
        let mut entries: Vec<_> = partial.pairings.unwrap_or_default().into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, partial_pairing) in entries {
            if let Some(form) = Self::validate_pairing(&key, partial_pairing, &mut errors) {
                pairings.insert(PairingId::new(key), form);
            }
        }

        diagnostics.extend(
            errors
                .into_iter()
                .map(|e| Diagnostic::Error(Error::Validation(e))),
        );
        diagnostics.extend(Self::shared_device_warnings(&pairings));

        // Check if there are any errors (not just warnings)
        if diagnostics.iter().any(|d| d.is_error()) {
            return Err(ConfigError::Invalid {
                report: format_diagnostics(&diagnostics),
                diagnostics,
            });
        }

        let config = Config {
            logging,
            api,
            mqtt,
            reachability,
            pairings,
        };

        Ok((config, diagnostics))
    }

    fn validate_api(partial: PartialApiConfig, errors: &mut Vec<ValidationError>) -> ApiConfig {
        let defaults = ApiConfig::default();

        let listen = match partial.listen.map(|s| s.into_inner()) {
            None => defaults.listen,
            Some(listen) => match listen.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    errors.push(ValidationError::new(
                        "api.listen",
                        format!("'{}' is not an IP address", listen),
                    ));
                    defaults.listen
                }
            },
        };

        ApiConfig {
            listen,
            port: partial.port.map(|s| s.into_inner()).unwrap_or(defaults.port),
        }
    }

    fn validate_mqtt(
        partial: PartialMqttConfig,
        errors: &mut Vec<ValidationError>,
    ) -> Option<MqttConfig> {
        let broker = partial.broker.map(|s| s.into_inner());
        let broker = match broker {
            Some(broker) if !broker.trim().is_empty() => broker,
            _ => {
                errors.push(ValidationError::new("mqtt.broker", "broker is required"));
                return None;
            }
        };

        let username = partial.username.map(|s| s.into_inner());
        let password = partial.password.map(|s| s.into_inner());
        if username.is_some() != password.is_some() {
            errors.push(ValidationError::new(
                "mqtt.username",
                "username and password must be set together",
            ));
        }

        let keep_alive_s = partial.keep_alive_s.map(|s| s.into_inner()).unwrap_or(30);
        if keep_alive_s == 0 {
            errors.push(ValidationError::new(
                "mqtt.keep_alive_s",
                "keep-alive must be at least one second",
            ));
        }

        Some(MqttConfig {
            broker,
            port: partial.port.map(|s| s.into_inner()).unwrap_or(1883),
            client_id: partial
                .client_id
                .map(|s| s.into_inner())
                .unwrap_or_else(|| "lightpaird".to_string()),
            discovery_prefix: partial
                .discovery_prefix
                .map(|s| s.into_inner())
                .unwrap_or_else(|| "homeassistant".to_string()),
            keep_alive_s,
            username,
            password,
        })
    }

    fn validate_reachability(
        partial: PartialReachabilityConfig,
        errors: &mut Vec<ValidationError>,
    ) -> ReachabilityConfig {
        let defaults = ReachabilityConfig::default();
        let config = ReachabilityConfig {
            poll_interval_ms: partial
                .poll_interval_ms
                .map(|s| s.into_inner())
                .unwrap_or(defaults.poll_interval_ms),
            max_poll_interval_ms: partial
                .max_poll_interval_ms
                .map(|s| s.into_inner())
                .unwrap_or(defaults.max_poll_interval_ms),
            backoff: partial
                .backoff
                .map(|s| s.into_inner())
                .unwrap_or(defaults.backoff),
            timeout_s: partial
                .timeout_s
                .map(|s| s.into_inner())
                .unwrap_or(defaults.timeout_s),
        };

        if config.poll_interval_ms == 0 {
            errors.push(ValidationError::new(
                "reachability.poll_interval_ms",
                "poll interval must be positive",
            ));
        }
        if config.max_poll_interval_ms < config.poll_interval_ms {
            errors.push(ValidationError::new(
                "reachability.max_poll_interval_ms",
                format!(
                    "{} is below poll_interval_ms ({})",
                    config.max_poll_interval_ms, config.poll_interval_ms
                ),
            ));
        }
        if !config.backoff.is_finite() || config.backoff < 1.0 {
            errors.push(ValidationError::new(
                "reachability.backoff",
                format!("{} must be a finite number >= 1.0", config.backoff),
            ));
        }
        if config.timeout_s == 0 {
            errors.push(ValidationError::new(
                "reachability.timeout_s",
                "timeout must be positive",
            ));
        }

        config
    }

    /// Check a configured pairing without consulting the device directory;
    /// devices are resolved when the pairing is created at startup.
    fn validate_pairing(
        key: &str,
        partial: PartialPairing,
        errors: &mut Vec<ValidationError>,
    ) -> Option<PairingForm> {
        let before = errors.len();
        let mut required = |field: &str, value: Option<String>| {
            value.unwrap_or_else(|| {
                errors.push(ValidationError::new(
                    format!("pairings.{}.{}", key, field),
                    format!("{} is required", field),
                ));
                String::new()
            })
        };

        let name = required("name", partial.name);
        let physical_device = required("physical_device", partial.physical_device);
        let smart_device = required("smart_device", partial.smart_device);
        if errors.len() > before {
            return None;
        }

        let form = PairingForm::new(name, physical_device, smart_device)
            .brightness_on_switch(
                partial
                    .brightness_on_switch
                    .unwrap_or(i64::from(DEFAULT_BRIGHTNESS_ON_SWITCH)),
            )
            .turn_off_physical_on_off(partial.turn_off_physical_on_off.unwrap_or(false));

        let problems = form.check(None);
        if problems.is_empty() {
            Some(form)
        } else {
            errors.extend(problems.into_iter().map(|p| {
                ValidationError::new(format!("pairings.{}.{}", key, p.field), p.message)
            }));
            None
        }
    }

    /// Every device referenced by a configured pairing, each listed once
    pub fn pairing_devices(&self) -> Vec<DeviceId> {
        self.pairings
            .values()
            .flat_map(|form| [form.physical_device.trim(), form.smart_device.trim()])
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(DeviceId::new)
            .collect()
    }

    fn shared_device_warnings(pairings: &BTreeMap<PairingId, PairingForm>) -> Vec<Diagnostic> {
        let mut users: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (id, form) in pairings {
            for device in [form.physical_device.trim(), form.smart_device.trim()] {
                users.entry(device).or_default().push(id.to_string());
            }
        }

        users
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(device, pairings)| {
                Diagnostic::Warning(Warning::SharedDevice {
                    device: device.to_string(),
                    pairings,
                })
            })
            .collect()
    }
}
