//! Service configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tagmux_core::{ConsumerOptions, CoordinatorConfig};
use tagmux_types::{Feature, FeatureConfig, FeatureSet, SamplePeriod, TagId};

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Coordinator timing.
    pub coordinator: CoordinatorSettings,
    /// Prepended to every reading id, e.g. `"b827eb0a1b2c."`.
    pub message_prefix: Option<String>,
    /// Consumers, in priority order.
    pub consumers: Vec<ConsumerConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - Server bind address is valid (host:port format)
    /// - Broadcast buffer is non-zero
    /// - Staleness window is non-zero
    /// - Consumer names are non-empty and unique
    ///
    /// Sample periods are never rejected; they are clamped when applied.
    ///
    /// # Example
    ///
    /// ```
    /// use tagmux_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.coordinator.validate());

        let mut seen_names = HashSet::new();
        for (i, consumer) in self.consumers.iter().enumerate() {
            let prefix = format!("consumers[{}]", i);
            errors.extend(consumer.validate(&prefix));

            if !seen_names.insert(consumer.name.to_lowercase()) {
                errors.push(ValidationError {
                    field: format!("{}.name", prefix),
                    message: format!("duplicate consumer name '{}'", consumer.name),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// The message id prefix, empty when unset.
    pub fn prefix(&self) -> &str {
        self.message_prefix.as_deref().unwrap_or_default()
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
    /// Capacity of the WebSocket readings channel.
    pub broadcast_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            broadcast_buffer: 100,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError {
                field: "server.bind".to_string(),
                message: "bind address cannot be empty".to_string(),
            });
        } else {
            match self.bind.rsplit_once(':') {
                None => errors.push(ValidationError {
                    field: "server.bind".to_string(),
                    message: format!(
                        "invalid bind address '{}': expected format 'host:port'",
                        self.bind
                    ),
                }),
                Some((_, port)) => match port.parse::<u16>() {
                    Ok(0) => errors.push(ValidationError {
                        field: "server.bind".to_string(),
                        message: "port cannot be 0".to_string(),
                    }),
                    Err(_) => errors.push(ValidationError {
                        field: "server.bind".to_string(),
                        message: format!("invalid port '{}': must be a number 1-65535", port),
                    }),
                    Ok(_) => {}
                },
            }
        }

        if self.broadcast_buffer == 0 {
            errors.push(ValidationError {
                field: "server.broadcast_buffer".to_string(),
                message: "broadcast buffer must be at least 1".to_string(),
            });
        }

        errors
    }
}

/// Coordinator timing, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub staleness_window_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub settle_delay_ms: u64,
    /// Connect as soon as every consumer is ready, without waiting for `/sensortag/safe`.
    pub initially_safe: bool,
    pub scan_on_start: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            staleness_window_ms: 2000,
            reconnect_backoff_ms: 5000,
            settle_delay_ms: 1000,
            initially_safe: true,
            scan_on_start: true,
        }
    }
}

impl CoordinatorSettings {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.staleness_window_ms == 0 {
            errors.push(ValidationError {
                field: "coordinator.staleness_window_ms".to_string(),
                message: "staleness window must be at least 1 ms".to_string(),
            });
        }
        errors
    }

    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
            .staleness_window(Duration::from_millis(self.staleness_window_ms))
            .reconnect_backoff(Duration::from_millis(self.reconnect_backoff_ms))
            .settle_delay(Duration::from_millis(self.settle_delay_ms))
            .initially_safe(self.initially_safe)
            .scan_on_start(self.scan_on_start)
    }
}

/// One consumer: the tags it wants and the sensors to enable on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub name: String,
    /// Tag addresses, in any common notation (`B0:B4:48:C9:8A:83`, `b0b448c98a83`).
    pub tags: Vec<String>,
    pub temperature: bool,
    pub accelerometer: bool,
    pub humidity: bool,
    pub magnetometer: bool,
    pub pressure: bool,
    pub gyroscope: bool,
    pub light: bool,
    pub buttons: bool,
    pub accelerometer_period: Option<u64>,
    pub magnetometer_period: Option<u64>,
    pub gyroscope_period: Option<u64>,
    pub light_period: Option<u64>,
}

impl ConsumerConfig {
    /// Validate consumer configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.name", prefix),
                message: "consumer name cannot be empty".to_string(),
            });
        }

        for (i, tag) in self.tags.iter().enumerate() {
            if TagId::new(tag).as_str().is_empty() {
                errors.push(ValidationError {
                    field: format!("{}.tags[{}]", prefix, i),
                    message: "tag address cannot be empty".to_string(),
                });
            }
        }

        errors
    }

    /// Enabled features, with periods clamped into the supported range.
    pub fn features(&self) -> FeatureSet {
        let flags = [
            (Feature::Temperature, self.temperature, None),
            (Feature::Accelerometer, self.accelerometer, self.accelerometer_period),
            (Feature::Humidity, self.humidity, None),
            (Feature::Magnetometer, self.magnetometer, self.magnetometer_period),
            (Feature::Pressure, self.pressure, None),
            (Feature::Gyroscope, self.gyroscope, self.gyroscope_period),
            (Feature::Light, self.light, self.light_period),
            (Feature::Buttons, self.buttons, None),
        ];
        flags
            .into_iter()
            .filter(|(_, enabled, _)| *enabled)
            .map(|(feature, _, period)| match period {
                Some(ms) => FeatureConfig::with_period(feature, SamplePeriod::clamped(ms)),
                None => FeatureConfig::with_defaults(feature),
            })
            .collect()
    }

    pub fn to_options(&self) -> ConsumerOptions {
        ConsumerOptions::new(self.tags.iter().map(TagId::new)).features(self.features())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `consumers[0].name`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tagmux")
        .join("service.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.server.broadcast_buffer, 100);
        assert!(config.consumers.is_empty());
        assert_eq!(config.prefix(), "");
    }

    #[test]
    fn test_coordinator_settings_map_to_config() {
        let settings = CoordinatorSettings {
            staleness_window_ms: 3000,
            reconnect_backoff_ms: 100,
            settle_delay_ms: 0,
            initially_safe: false,
            scan_on_start: false,
        };
        let config = settings.to_coordinator_config();
        assert_eq!(config.staleness_window, Duration::from_secs(3));
        assert_eq!(config.reconnect_backoff, Duration::from_millis(100));
        assert_eq!(config.settle_delay, Duration::ZERO);
        assert!(!config.initially_safe);
        assert!(!config.scan_on_start);
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            message_prefix = "b827eb0a1b2c."

            [server]
            bind = "0.0.0.0:1880"

            [coordinator]
            initially_safe = false

            [[consumers]]
            name = "kitchen"
            tags = ["B0:B4:48:C9:8A:83", "b0b448c98a84"]
            temperature = true
            light = true
            light_period = 5000

            [[consumers]]
            name = "desk"
            tags = ["b0b448c98a85"]
            accelerometer = true
            accelerometer_period = 3
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.prefix(), "b827eb0a1b2c.");
        assert_eq!(config.server.broadcast_buffer, 100);
        assert!(!config.coordinator.initially_safe);
        assert_eq!(config.coordinator.reconnect_backoff_ms, 5000);

        let kitchen = config.consumers[0].to_options();
        assert_eq!(kitchen.filter[0].as_str(), "b0b448c98a83");
        assert_eq!(kitchen.features.len(), 2);
        assert_eq!(
            kitchen.features.get(Feature::Light).and_then(|f| f.period()),
            Some(SamplePeriod::clamped(2550))
        );

        let desk = config.consumers[1].features();
        assert_eq!(
            desk.get(Feature::Accelerometer).and_then(|f| f.period()),
            Some(SamplePeriod::clamped(10))
        );
    }

    #[test]
    fn test_features_default_period() {
        let consumer = ConsumerConfig {
            gyroscope: true,
            buttons: true,
            ..Default::default()
        };
        let features = consumer.features();
        assert_eq!(
            features.get(Feature::Gyroscope).and_then(|f| f.period()),
            Some(SamplePeriod::DEFAULT)
        );
        assert!(features.contains(Feature::Buttons));
        assert!(!features.contains(Feature::Temperature));
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("service.toml");

        let config = Config {
            server: ServerConfig {
                bind: "0.0.0.0:9090".to_string(),
                broadcast_buffer: 50,
            },
            consumers: vec![ConsumerConfig {
                name: "lab".to_string(),
                tags: vec!["b0b448c98a83".to_string()],
                humidity: true,
                ..Default::default()
            }],
            ..Default::default()
        };

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();

        assert_eq!(loaded.server.bind, "0.0.0.0:9090");
        assert_eq!(loaded.server.broadcast_buffer, 50);
        assert_eq!(loaded.consumers, config.consumers);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/service.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not [valid toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("tagmux/service.toml"));
    }

    #[test]
    fn test_server_bind_validation() {
        let cases = [
            ("", false),
            ("localhost", false),
            ("127.0.0.1:0", false),
            ("127.0.0.1:http", false),
            ("127.0.0.1:1880", true),
            ("[::1]:8080", true),
        ];
        for (bind, valid) in cases {
            let server = ServerConfig {
                bind: bind.to_string(),
                ..Default::default()
            };
            assert_eq!(server.validate().is_empty(), valid, "bind {:?}", bind);
        }
    }

    #[test]
    fn test_zero_buffers_rejected() {
        let mut config = Config::default();
        config.server.broadcast_buffer = 0;
        config.coordinator.staleness_window_ms = 0;

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_duplicate_consumer_names() {
        let config = Config {
            consumers: vec![
                ConsumerConfig {
                    name: "Kitchen".to_string(),
                    ..Default::default()
                },
                ConsumerConfig {
                    name: "kitchen".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "consumers[1].name");
    }

    #[test]
    fn test_empty_names_and_tags_rejected() {
        let consumer = ConsumerConfig {
            name: "  ".to_string(),
            tags: vec!["::".to_string()],
            ..Default::default()
        };
        let errors = consumer.validate("consumers[0]");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].field, "consumers[0].tags[0]");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ConfigError::Validation(vec![ValidationError {
            field: "server.bind".to_string(),
            message: "bind address cannot be empty".to_string(),
        }]);
        let msg = err.to_string();
        assert!(msg.contains("Configuration validation failed"));
        assert!(msg.contains("  - server.bind: bind address cannot be empty"));
    }
}
