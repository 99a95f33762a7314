//! Configuration using Figment
//!
//! Settings are layered, highest precedence last:
//! 1. Built-in defaults
//! 2. A TOML file (`config/bench.toml` unless another path is given)
//! 3. Environment variables prefixed with `BENCHSEQ_`, nested keys split on `__`
//!
//! ```text
//! BENCHSEQ_APPLICATION__LOG_LEVEL=debug
//! BENCHSEQ_SCHEDULER__POLL_INTERVAL_MS=50
//! BENCHSEQ_SEQUENCES__SAFE_EXIT=stop_all
//! ```

use crate::error::ConfigError;
use crate::instrument::InstrumentKind;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "BENCHSEQ_";
/// Configuration file used when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/bench.toml";

static RESOURCE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^(ASRL|GPIB|PXI|visa|TCPIP|USB|VXI)").unwrap()
});

static SERIAL_PORT: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^(COM\d+|tty\S+|/dev/tty\S+)$").unwrap()
});

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Name and logging.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Saved-sequence directory and safe-exit name.
    #[serde(default)]
    pub sequences: SequencesConfig,
    /// Wait polling and safe-exit retries.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Instruments on the bench.
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Shown in the startup log line.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable text
    #[serde(default)]
    pub log_json: bool,
    /// Also append logs to this file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_json: false,
            log_file: None,
        }
    }
}

/// Where saved sequences live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencesConfig {
    /// Directory holding `<name>.yaml` documents.
    #[serde(default = "default_sequence_dir")]
    pub directory: PathBuf,
    /// Saved sequence replayed after a fatal dispatch error or an abort
    #[serde(default = "default_safe_exit")]
    pub safe_exit: String,
}

impl Default for SequencesConfig {
    fn default() -> Self {
        Self {
            directory: default_sequence_dir(),
            safe_exit: default_safe_exit(),
        }
    }
}

/// Scheduler tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often a wait checks for pause, skip and abort
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Safe-exit attempts before giving up
    #[serde(default = "default_safe_exit_attempts")]
    pub safe_exit_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            safe_exit_attempts: default_safe_exit_attempts(),
        }
    }
}

impl SchedulerConfig {
    /// `poll_interval_ms` as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One instrument on the bench
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Instrument id as used in sequences.
    pub id: String,
    /// Disabled instruments are never connected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the built-in address.
    #[serde(default)]
    pub address: Option<Address>,
}

/// How to reach an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    /// Remote shell login, used by the charger.
    Ssh {
        /// Host name or IP address.
        host: String,
        /// Login user.
        #[serde(default)]
        user: String,
        /// Login password.
        #[serde(default)]
        password: String,
    },
    /// VISA resource string or serial port name.
    Resource(String),
}

impl Address {
    /// True for VISA resource strings.
    pub fn is_visa_resource(&self) -> bool {
        matches!(self, Address::Resource(r) if RESOURCE_PREFIX.is_match(r))
    }

    /// True for serial port names.
    pub fn is_serial_port(&self) -> bool {
        matches!(self, Address::Resource(r) if SERIAL_PORT.is_match(r))
    }

    fn validate(&self, id: &str) -> Result<(), ConfigError> {
        match self {
            Address::Ssh { host, .. } if host.trim().is_empty() => Err(
                ConfigError::ValidationError(format!("Instrument '{}': SSH host cannot be empty", id)),
            ),
            Address::Ssh { .. } => Ok(()),
            Address::Resource(_) if self.is_visa_resource() || self.is_serial_port() => Ok(()),
            Address::Resource(r) => Err(ConfigError::ValidationError(format!(
                "Instrument '{}': '{}' is neither a VISA resource (ASRL, GPIB, PXI, visa, TCPIP, USB, VXI) nor a serial port",
                id, r
            ))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ssh { host, user, .. } if user.is_empty() => write!(f, "ssh://{}", host),
            Address::Ssh { host, user, .. } => write!(f, "ssh://{}@{}", user, host),
            Address::Resource(r) => f.write_str(r),
        }
    }
}

fn default_name() -> String {
    "Bench Sequencer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sequence_dir() -> PathBuf {
    PathBuf::from("predefine_sequence")
}

fn default_safe_exit() -> String {
    "safe_exit".to_string()
}

fn default_poll_interval() -> u64 {
    100
}

fn default_safe_exit_attempts() -> u32 {
    3
}

fn default_enabled() -> bool {
    true
}

/// `config/bench.toml` if present, else the per-user config directory.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_PATH);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("bench-sequencer").join("bench.toml"))
        .unwrap_or(local)
}

impl Settings {
    /// Load from [`default_config_path`].
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific file path. A missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Checks log level, scheduler bounds, instrument ids and addresses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.scheduler.safe_exit_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "safe_exit_attempts must be >= 1".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            let id = instrument.id.to_lowercase();
            if !ids.insert(id.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            if InstrumentKind::from_id(&id).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown instrument ID '{}'. Must be one of: {}",
                    instrument.id,
                    InstrumentKind::ALL
                        .iter()
                        .map(|k| k.default_id())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            if let Some(address) = &instrument.address {
                address.validate(&instrument.id)?;
            }
        }

        Ok(())
    }

    /// Configuration for `id`, compared case-insensitively.
    pub fn instrument(&self, id: &str) -> Option<&InstrumentConfig> {
        self.instruments
            .iter()
            .find(|i| i.id.eq_ignore_ascii_case(id))
    }

    /// Configured instruments that are switched on.
    pub fn enabled_instruments(&self) -> Vec<&InstrumentConfig> {
        self.instruments.iter().filter(|i| i.enabled).collect()
    }

    /// Lower-cased ids of instruments switched off in configuration.
    pub fn disabled_instruments(&self) -> BTreeSet<String> {
        self.instruments
            .iter()
            .filter(|i| !i.enabled)
            .map(|i| i.id.to_lowercase())
            .collect()
    }

    /// Lower-cased id → address for every enabled instrument with one.
    pub fn addresses(&self) -> BTreeMap<String, Address> {
        self.enabled_instruments()
            .into_iter()
            .filter_map(|i| i.address.clone().map(|a| (i.id.to_lowercase(), a)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_instruments(instruments: Vec<InstrumentConfig>) -> Settings {
        Settings {
            instruments,
            ..Settings::default()
        }
    }

    fn instrument(id: &str, address: Address) -> InstrumentConfig {
        InstrumentConfig {
            id: id.to_string(),
            enabled: true,
            address: Some(address),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scheduler.safe_exit_attempts, 3);
        assert_eq!(settings.scheduler.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_disabled_instruments_are_lowercased() {
        let mut scope = instrument("Oscilloscope", Address::Resource("USB0::1::INSTR".into()));
        scope.enabled = false;
        let settings = with_instruments(vec![
            scope,
            instrument("dc_source", Address::Resource("USB0::2::INSTR".into())),
        ]);
        assert_eq!(
            settings.disabled_instruments(),
            BTreeSet::from(["oscilloscope".to_string()])
        );
        assert_eq!(settings.enabled_instruments().len(), 1);
        assert!(!settings.addresses().contains_key("oscilloscope"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_address_kinds() {
        assert!(Address::Resource("TCPIP0::10.0.0.5::INSTR".into()).is_visa_resource());
        assert!(Address::Resource("COM4".into()).is_serial_port());
        assert!(Address::Resource("/dev/ttyUSB0".into()).is_serial_port());
        assert!(!Address::Resource("10.0.0.5".into()).is_visa_resource());
    }

    #[test]
    fn test_bad_address_rejected() {
        let settings = with_instruments(vec![instrument(
            "ac_source",
            Address::Resource("10.0.0.5".into()),
        )]);
        assert!(settings.validate().is_err());

        let settings = with_instruments(vec![instrument(
            "armxl",
            Address::Ssh {
                host: " ".into(),
                user: "root".into(),
                password: String::new(),
            },
        )]);
        assert!(settings
            .validate()
            .unwrap_err()
            .to_string()
            .contains("SSH host"));
    }

    #[test]
    fn test_duplicate_and_unknown_ids() {
        let settings = with_instruments(vec![
            instrument("dc_source", Address::Resource("USB0::1::INSTR".into())),
            instrument("DC_SOURCE", Address::Resource("USB0::2::INSTR".into())),
        ]);
        assert!(settings
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Duplicate"));

        let settings = with_instruments(vec![instrument(
            "laser",
            Address::Resource("USB0::1::INSTR".into()),
        )]);
        assert!(settings
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Unknown instrument ID"));
    }
}
