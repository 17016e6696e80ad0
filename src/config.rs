//! On-disk daemon configuration: port-filter policy, log level, and
//! per-driver serial engine overrides. Loaded once at startup, falling
//! back to built-in defaults when no config file is present.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::discovery::{PortFilter, Rule};
use crate::error::{CoreError, Result};
use crate::port::Subsystem;

/// Default per-driver serial tuning, used when a driver has no entry of
/// its own in `[serial.*]`.
const DEFAULT_SEND_DELAY_US: u64 = 0;
const DEFAULT_FLASH_OK: bool = true;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ConfigSubsystem {
    Tty,
    Net,
    QmiCdev,
    MbimCdev,
    Usb,
}

impl From<ConfigSubsystem> for Subsystem {
    fn from(subsystem: ConfigSubsystem) -> Self {
        match subsystem {
            ConfigSubsystem::Tty => Subsystem::Tty,
            ConfigSubsystem::Net => Subsystem::Net,
            ConfigSubsystem::QmiCdev => Subsystem::QmiCdev,
            ConfigSubsystem::MbimCdev => Subsystem::MbimCdev,
            ConfigSubsystem::Usb => Subsystem::Usb,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RuleConfig {
    subsystem: Option<ConfigSubsystem>,
    driver: Option<String>,
}

impl From<RuleConfig> for Rule {
    fn from(rule: RuleConfig) -> Self {
        Rule { subsystem: rule.subsystem.map(Subsystem::from), driver: rule.driver }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PortFilterConfig {
    #[serde(default)]
    whitelist: Vec<RuleConfig>,
    #[serde(default)]
    blacklist: Vec<RuleConfig>,
}

/// Per-driver serial engine tuning, overriding the built-in default for
/// drivers with known quirks (e.g. needing a byte-pacing delay, or not
/// tolerating a baud-rate flash on reopen).
#[derive(Debug, Clone, Copy, Deserialize)]
struct SerialOverride {
    #[serde(default)]
    send_delay_us: Option<u64>,
    #[serde(default)]
    flash_ok: Option<bool>,
}

/// Operator log level, mapped onto `tracing::Level` in `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Err,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Err => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    log_level: LogLevel,
    #[serde(default)]
    port_filter: PortFilterConfig,
    #[serde(default)]
    serial: HashMap<String, SerialOverride>,
}

/// Daemon-wide static policy: `PortFilter`-feeding whitelist/blacklist
/// rules, the default log level, and per-driver serial overrides.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    port_filter: PortFilter,
    serial: HashMap<String, SerialOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self { log_level: LogLevel::default(), port_filter: PortFilter::default(), serial: HashMap::new() }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to [`Config::default`]
    /// if the file doesn't exist. A present-but-malformed file is an
    /// error: operators should notice a typo, not silently run defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(CoreError::Failed(format!("reading {}: {err}", path.display())).into()),
        };
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(raw).map_err(|err| CoreError::Failed(format!("invalid config: {err}")))?;

        let whitelist = raw.port_filter.whitelist.into_iter().map(Rule::from).collect();
        let blacklist = raw.port_filter.blacklist.into_iter().map(Rule::from).collect();

        Ok(Self {
            log_level: raw.log_level,
            port_filter: PortFilter::new(whitelist, blacklist),
            serial: raw.serial,
        })
    }

    pub fn port_filter(&self) -> &PortFilter {
        &self.port_filter
    }

    /// Effective `send_delay_us` for a given serial driver, falling back
    /// to the engine's own default when unconfigured.
    pub fn send_delay_us(&self, driver: &str) -> u64 {
        self.serial.get(driver).and_then(|o| o.send_delay_us).unwrap_or(DEFAULT_SEND_DELAY_US)
    }

    /// Effective `flash_ok` for a given serial driver.
    pub fn flash_ok(&self, driver: &str) -> bool {
        self.serial.get(driver).and_then(|o| o.flash_ok).unwrap_or(DEFAULT_FLASH_OK)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/modemd.toml")).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.port_filter().accepts(Subsystem::Tty, "option"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "this is not valid toml =====").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn parses_port_filter_and_overrides() {
        let raw = r#"
            log_level = "DEBUG"

            [[port_filter.blacklist]]
            driver = "sierra_net"

            [serial.option]
            send_delay_us = 1000
            flash_ok = false
        "#;
        let config = Config::parse(raw).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(!config.port_filter().accepts(Subsystem::Net, "sierra_net"));
        assert!(config.port_filter().accepts(Subsystem::Tty, "option"));
        assert_eq!(config.send_delay_us("option"), 1000);
        assert!(!config.flash_ok("option"));
        assert_eq!(config.send_delay_us("qcserial"), DEFAULT_SEND_DELAY_US);
        assert!(config.flash_ok("qcserial"));
    }
}
