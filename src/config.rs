//! Configuration management.
//!
//! Settings are layered from a TOML file via the `config` crate and
//! deserialized into [`Settings`]. Every timeout, retry and TTL knob the
//! session and registry layers consume lives here so that policy is never
//! hard-coded at call sites.

use crate::error::LabError;
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level settings for a labhost process.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Log filter directive (e.g. "info", "labhost=debug").
    pub log_level: String,
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub retry: RetrySettings,
    pub registry: RegistrySettings,
    pub timeouts: TimeoutSettings,
    /// Instrument inventory, keyed by logical name.
    pub instruments: HashMap<String, InstrumentConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerSettings::default(),
            session: SessionSettings::default(),
            retry: RetrySettings::default(),
            registry: RegistrySettings::default(),
            timeouts: TimeoutSettings::default(),
            instruments: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address for the proxy listener.
    pub bind_addr: String,
    pub port: u16,
    /// Upper bound on a single wire frame payload.
    pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 9090,
            max_frame_bytes: 1 << 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionSettings {
    /// Lease lifetime; an unrenewed session is revoked after this long.
    #[serde(with = "humantime_serde")]
    pub lease_timeout: Duration,
    /// Acquire wait bound applied when a client does not supply one.
    #[serde(with = "humantime_serde")]
    pub default_acquire_timeout: Duration,
    /// Command channel depth for each instrument actor.
    pub actor_queue_depth: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(60),
            default_acquire_timeout: Duration::from_secs(5),
            actor_queue_depth: 32,
        }
    }
}

/// Bounded retry policy for transient transport faults.
///
/// `max_attempts` counts the initial try, so `3` means one execution plus
/// two reconnect-and-retry rounds before `DeviceUnavailable`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegistrySettings {
    /// Entries not renewed within this interval are evicted.
    #[serde(with = "humantime_serde")]
    pub entry_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutSettings {
    #[serde(with = "humantime_serde")]
    pub serial_read: Duration,
    #[serde(with = "humantime_serde")]
    pub network_read: Duration,
    /// Delay between close and re-open during an adapter reset.
    #[serde(with = "humantime_serde")]
    pub reset_settle: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            serial_read: Duration::from_secs(2),
            network_read: Duration::from_secs(5),
            reset_settle: Duration::from_millis(500),
        }
    }
}

/// One instrument in the inventory: which driver variant to build and the
/// transport it talks through.
#[derive(Debug, Deserialize, Clone)]
pub struct InstrumentConfig {
    /// Driver type tag (e.g. "scpi", "mock").
    pub driver: String,
    pub transport: TransportConfig,
    /// Driver-specific command templates, logical name -> exchange template.
    #[serde(default)]
    pub commands: HashMap<String, String>,
}

/// Per-instrument transport parameters, tagged by transport kind.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Raw socket instrument (e.g. a bench supply with an Ethernet port).
    Tcp {
        host: String,
        port: u16,
        #[serde(default, with = "humantime_serde::option")]
        read_timeout: Option<Duration>,
    },
    /// RS-232 instrument.
    Serial {
        port: String,
        baud_rate: u32,
        #[serde(default, with = "humantime_serde::option")]
        read_timeout: Option<Duration>,
        #[serde(default = "default_line_terminator")]
        line_terminator: String,
    },
    /// GPIB/USB/LXI instrument behind a VISA resource string.
    Visa {
        resource: String,
        #[serde(default, with = "humantime_serde::option")]
        read_timeout: Option<Duration>,
    },
    /// In-memory transport for tests and dry runs.
    Mock {
        #[serde(default)]
        replies: HashMap<String, String>,
    },
}

fn default_line_terminator() -> String {
    "\r\n".to_string()
}

impl Settings {
    /// Load settings from `config/{name}.toml` (defaults to `config/default`).
    pub fn new(config_name: Option<&str>) -> Result<Self, LabError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(LabError::Config)?;

        let settings: Settings = s.try_deserialize().map_err(LabError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from an explicit file path.
    pub fn from_file(path: &Path) -> Result<Self, LabError> {
        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(LabError::Config)?;

        let settings: Settings = s.try_deserialize().map_err(LabError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation, beyond what deserialization catches.
    pub fn validate(&self) -> Result<(), LabError> {
        if self.retry.max_attempts == 0 {
            return Err(LabError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_base > self.retry.backoff_max {
            return Err(LabError::Configuration(
                "retry.backoff_base exceeds retry.backoff_max".to_string(),
            ));
        }
        if self.registry.sweep_interval > self.registry.entry_ttl {
            return Err(LabError::Configuration(
                "registry.sweep_interval exceeds registry.entry_ttl".to_string(),
            ));
        }
        if self.session.actor_queue_depth == 0 {
            return Err(LabError::Configuration(
                "session.actor_queue_depth must be at least 1".to_string(),
            ));
        }
        for (name, cfg) in &self.instruments {
            if cfg.driver.is_empty() {
                return Err(LabError::Configuration(format!(
                    "instrument '{name}' has an empty driver tag"
                )));
            }
        }
        Ok(())
    }
}
