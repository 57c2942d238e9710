use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::dispatch::BackpressurePolicy;

pub const CONFIG_ENV_VAR: &str = "HERA_MASTER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "hera-master.toml";

pub const DEFAULT_CONFIG_TOML: &str = r#"
[logging]
level = "info"
human_friendly = false

[server]
host = "0.0.0.0"
port = 8887
tls_enabled = false
read_timeout_ms = 250
write_timeout_ms = 5000

[wire]
max_envelope_size_bytes = 8388608

[dispatch]
worker_threads = 16
queue_capacity = 1024
backpressure = "reject"
completion_poll_ms = 100

[heartbeat]
sweep_interval_ms = 5000
worker_timeout_ms = 60000

[storage]
engine = "memory"
path = "~/.hera-master/data"

[storage.sled]
mode = "high_throughput"
"#;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub dispatch: DispatchConfig,
    pub heartbeat: HeartbeatConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct WireConfig {
    pub max_envelope_size_bytes: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DispatchConfig {
    pub worker_threads: usize,
    pub queue_capacity: usize,
    pub backpressure: String,
    pub completion_poll_ms: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub sweep_interval_ms: u64,
    pub worker_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    #[serde(default)]
    pub sled: SledConfig,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SledConfig {
    pub cache_capacity: Option<u64>,
    pub mode: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".to_owned(),
                human_friendly: false,
            },
            server: ServerConfig {
                host: "0.0.0.0".to_owned(),
                port: 8887,
                tls_enabled: false,
                read_timeout_ms: 250,
                write_timeout_ms: default_write_timeout_ms(),
            },
            wire: WireConfig {
                max_envelope_size_bytes: 8 * 1024 * 1024,
            },
            dispatch: DispatchConfig {
                worker_threads: 16,
                queue_capacity: 1024,
                backpressure: "reject".to_owned(),
                completion_poll_ms: 100,
            },
            heartbeat: HeartbeatConfig {
                sweep_interval_ms: 5_000,
                worker_timeout_ms: 60_000,
            },
            storage: StorageConfig {
                engine: "memory".to_owned(),
                path: "~/.hera-master/data".to_owned(),
                sled: SledConfig {
                    cache_capacity: None,
                    mode: Some("high_throughput".to_owned()),
                },
            },
        }
    }
}

/// Where the effective configuration came from; logged at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    BuiltInDefaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::BuiltInDefaults => write!(f, "<built-in defaults>"),
        }
    }
}

impl AppConfig {
    /// Resolves the config file (`--config <path>`, then `HERA_MASTER_CONFIG`,
    /// then `./hera-master.toml`, then built-in defaults) and applies the
    /// remaining `--section.key value` overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<(Self, ConfigSource), ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();

        let explicit = if args.first().map(String::as_str) == Some("--config") {
            if args.len() < 2 {
                return Err(ConfigError::MissingValueForArg {
                    key: "config".to_owned(),
                });
            }
            let path = args.remove(1);
            args.remove(0);
            Some(PathBuf::from(path))
        } else {
            std::env::var(CONFIG_ENV_VAR)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        };

        if let Some(path) = explicit {
            let config = Self::load_from_toml_with_args(&path, args)?;
            return Ok((config, ConfigSource::File(path)));
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            let config = Self::load_from_toml_with_args(&local, args)?;
            return Ok((config, ConfigSource::File(local)));
        }

        let config = Self::load_from_toml_str_with_args(DEFAULT_CONFIG_TOML, "<defaults>", args)?;
        Ok((config, ConfigSource::BuiltInDefaults))
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let origin = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: origin.clone(),
            source,
        })?;

        Self::load_from_toml_str_with_args(&toml_content, &origin, args)
    }

    fn load_from_toml_str_with_args(
        toml_content: &str,
        origin: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: origin.to_owned(),
                    source,
                })?;

        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.worker_threads == 0 {
            return Err(ConfigError::invalid("dispatch.worker_threads", "must be >= 1"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::invalid("dispatch.queue_capacity", "must be >= 1"));
        }
        if BackpressurePolicy::parse(&self.dispatch.backpressure).is_none() {
            return Err(ConfigError::invalid(
                "dispatch.backpressure",
                "allowed values: reject, queue",
            ));
        }
        if self.dispatch.completion_poll_ms == 0 {
            return Err(ConfigError::invalid("dispatch.completion_poll_ms", "must be > 0"));
        }
        if self.wire.max_envelope_size_bytes == 0
            || self.wire.max_envelope_size_bytes > u32::MAX as usize
        {
            return Err(ConfigError::invalid(
                "wire.max_envelope_size_bytes",
                "must be between 1 and 4294967295",
            ));
        }
        if self.heartbeat.sweep_interval_ms < 100 {
            return Err(ConfigError::invalid("heartbeat.sweep_interval_ms", "must be >= 100"));
        }
        if self.heartbeat.worker_timeout_ms <= self.heartbeat.sweep_interval_ms {
            return Err(ConfigError::invalid(
                "heartbeat.worker_timeout_ms",
                "must be greater than heartbeat.sweep_interval_ms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidSetting {
        key: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: &'static str) -> Self {
        Self::InvalidSetting { key, reason }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidSetting { key, reason } => write!(f, "invalid setting '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(key) = arg.strip_prefix("--").filter(|key| !key.is_empty()) else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };
        let key = key.to_owned();

        let value = iter
            .next()
            .ok_or_else(|| ConfigError::MissingValueForArg { key: key.clone() })?;
        parsed.push((key, value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    *current = parse_value_using_current_type(key_path, raw_value, current)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let mismatch = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| mismatch("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| mismatch("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| mismatch("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError, ConfigSource, DEFAULT_CONFIG_TOML};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "hera-master-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn built_in_defaults_match_default_impl() {
        let path = write_temp_config(DEFAULT_CONFIG_TOML, "defaults");
        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("default config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn server_write_timeout_defaults_when_omitted() {
        let legacy = DEFAULT_CONFIG_TOML.replace("write_timeout_ms = 5000\n", "");
        let config =
            AppConfig::load_from_toml_str_with_args(&legacy, "legacy", Vec::<String>::new())
                .expect("config without write timeout should load");
        assert_eq!(config.server.write_timeout_ms, 5_000);

        let path = write_temp_config(DEFAULT_CONFIG_TOML, "write-timeout");
        let config = AppConfig::load_from_toml_with_args(
            &path,
            args(&["--server.write_timeout_ms", "750"]),
        )
        .expect("write timeout override should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");
        assert_eq!(config.server.write_timeout_ms, 750);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(DEFAULT_CONFIG_TOML, "override");
        let config = AppConfig::load_from_toml_with_args(
            &path,
            args(&[
                "--logging.level",
                "debug",
                "--dispatch.worker_threads",
                "4",
                "--dispatch.backpressure",
                "queue",
                "--storage.sled.mode",
                "low_space",
            ]),
        )
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.dispatch.worker_threads, 4);
        assert_eq!(config.dispatch.backpressure, "queue");
        assert_eq!(config.storage.sled.mode.as_deref(), Some("low_space"));
    }

    #[test]
    fn rejects_unknown_override_path() {
        let path = write_temp_config(DEFAULT_CONFIG_TOML, "unknown-path");
        let err = AppConfig::load_from_toml_with_args(&path, args(&["--dispatch.turbo", "x"]))
            .expect_err("unknown override key should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_mistyped_override_value() {
        let path = write_temp_config(DEFAULT_CONFIG_TOML, "mistyped");
        let err = AppConfig::load_from_toml_with_args(&path, args(&["--server.port", "eighty"]))
            .expect_err("non-integer port should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
    }

    #[test]
    fn rejects_invalid_dispatch_settings() {
        let path = write_temp_config(DEFAULT_CONFIG_TOML, "invalid-dispatch");
        let zero_threads =
            AppConfig::load_from_toml_with_args(&path, args(&["--dispatch.worker_threads", "0"]))
                .expect_err("zero worker threads should fail");
        let bad_policy = AppConfig::load_from_toml_with_args(
            &path,
            args(&["--dispatch.backpressure", "drop-oldest"]),
        )
        .expect_err("unknown backpressure should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(
            zero_threads,
            ConfigError::InvalidSetting {
                key: "dispatch.worker_threads",
                ..
            }
        ));
        assert!(matches!(
            bad_policy,
            ConfigError::InvalidSetting {
                key: "dispatch.backpressure",
                ..
            }
        ));
    }

    #[test]
    fn discovery_honours_explicit_config_argument() {
        let path = write_temp_config(DEFAULT_CONFIG_TOML, "discovery");
        let (config, source) = AppConfig::load_with_discovery(args(&[
            "--config",
            path.to_str().expect("temp path should be utf-8"),
            "--server.port",
            "9001",
        ]))
        .expect("explicit config should load");
        fs::remove_file(&path).expect("temp config cleanup should succeed");

        assert_eq!(source, ConfigSource::File(path));
        assert_eq!(config.server.port, 9001);
    }

    #[test]
    fn discovery_requires_path_after_config_flag() {
        let err = AppConfig::load_with_discovery(args(&["--config"]))
            .expect_err("dangling --config should fail");
        assert!(matches!(err, ConfigError::MissingValueForArg { .. }));
    }
}
