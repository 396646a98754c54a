use crate::scheduler::Cadence;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Expose `gpu_util` / `gpu_vram` gauges over HTTP.
    #[serde(default)]
    pub prometheus: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval", with = "humantime_duration")]
    pub interval: Duration,
    #[serde(default = "default_error_backoff", with = "humantime_duration")]
    pub error_backoff: Duration,
    #[serde(default = "default_vendor_timeout", with = "humantime_duration")]
    pub vendor_timeout: Duration,
    #[serde(default = "default_disk_mount")]
    pub disk_mount: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prometheus: false,
            listen: default_listen(),
            interval: default_interval(),
            error_backoff: default_error_backoff(),
            vendor_timeout: default_vendor_timeout(),
            disk_mount: default_disk_mount(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.interval < MIN_INTERVAL {
            return Err(ConfigError::Validation(
                "interval должно быть >= 10ms".to_string(),
            ));
        }
        if self.error_backoff < MIN_INTERVAL {
            return Err(ConfigError::Validation(
                "error_backoff должно быть >= 10ms".to_string(),
            ));
        }
        if self.vendor_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "vendor_timeout должно быть > 0".to_string(),
            ));
        }
        if !Path::new(&self.disk_mount).is_absolute() {
            return Err(ConfigError::Validation(format!(
                "disk_mount '{}' должен быть абсолютным путём",
                self.disk_mount
            )));
        }
        Ok(())
    }

    pub fn cadence(&self) -> Cadence {
        Cadence {
            interval: self.interval,
            error_backoff: self.error_backoff,
            vendor_timeout: self.vendor_timeout,
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

mod humantime_duration {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

fn default_listen() -> String {
    "0.0.0.0:9100".to_string()
}

const fn default_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_error_backoff() -> Duration {
    Duration::from_secs(2)
}

const fn default_vendor_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_disk_mount() -> String {
    "/".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("конфигурация по умолчанию валидна");
        assert!(!cfg.prometheus);
        assert_eq!(cfg.listen, "0.0.0.0:9100");
        assert_eq!(cfg.cadence().interval, Duration::from_secs(1));
        assert_eq!(cfg.cadence().error_backoff, Duration::from_secs(2));
    }

    #[test]
    fn example_yaml_parses_to_defaults() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("пример разбирается");
        cfg.validate().expect("пример валиден");
        assert_eq!(cfg.interval, default_interval());
        assert_eq!(cfg.vendor_timeout, default_vendor_timeout());
        assert_eq!(cfg.disk_mount, "/");
    }

    #[test]
    fn partial_yaml_uses_humantime_durations() {
        let cfg: Config =
            serde_yaml::from_str("prometheus: true\ninterval: 250ms\nerror_backoff: 1m\n").unwrap();
        assert!(cfg.prometheus);
        assert_eq!(cfg.interval, Duration::from_millis(250));
        assert_eq!(cfg.error_backoff, Duration::from_secs(60));
        assert_eq!(cfg.listen, default_listen());
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = Config {
            listen: "not-an-addr".to_string(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let cfg = Config {
            interval: Duration::from_millis(1),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            vendor_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            disk_mount: "relative/dir".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Config::load_from_file("/gpumond/missing/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
