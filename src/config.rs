use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PointeuseConfig {
    pub reader: ReaderConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReaderConfig {
    /// Reader backend: "auto", "serial" or "pcsc"
    #[serde(default = "default_reader_backend")]
    pub backend: String,

    /// Serial port device (empty = auto-detect)
    #[serde(default)]
    pub serial_port: String,

    /// Serial line speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Index into the enumerated PC/SC reader list
    #[serde(default)]
    pub pcsc_reader_index: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    /// Base URL of the remote attendance API
    #[serde(default)]
    pub url: String,

    /// Account identifier sent with every request
    #[serde(default)]
    pub account_id: i64,

    /// API key attached as X-API-Key header
    #[serde(default)]
    pub api_key: String,

    /// Timeout for attendance submissions, in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_seconds: u64,

    /// Timeout for dashboard fetches, in seconds
    #[serde(default = "default_dashboard_timeout")]
    pub dashboard_timeout_seconds: u64,

    /// Accept self-signed TLS certificates (on-premise deployments)
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Path of the local SQLite mirror
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Path of the employee directory JSON file
    #[serde(default = "default_employees_file")]
    pub employees_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// Badge held this long without removal switches to consultation mode
    #[serde(default = "default_consultation_hold")]
    pub consultation_hold_seconds: u64,

    /// Read silence longer than this means the badge was removed
    #[serde(default = "default_removal_silence")]
    pub removal_silence_seconds: u64,

    /// Period of the presence watchdog
    #[serde(default = "default_presence_check")]
    pub presence_check_seconds: u64,

    /// Window during which stray reads of another badge are ignored
    #[serde(default = "default_processing_guard")]
    pub processing_guard_seconds: u64,
}

impl SessionConfig {
    pub fn consultation_hold(&self) -> Duration {
        Duration::from_secs(self.consultation_hold_seconds)
    }

    pub fn removal_silence(&self) -> Duration {
        Duration::from_secs(self.removal_silence_seconds)
    }

    pub fn presence_check(&self) -> Duration {
        Duration::from_secs(self.presence_check_seconds)
    }

    pub fn processing_guard(&self) -> Duration {
        Duration::from_secs(self.processing_guard_seconds)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl PointeuseConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("pointeuse.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("reader.backend", default_reader_backend())?
            .set_default("reader.serial_port", "")?
            .set_default("reader.baud_rate", default_baud_rate())?
            .set_default("reader.pcsc_reader_index", 0)?
            .set_default("api.url", "")?
            .set_default("api.account_id", 0)?
            .set_default("api.api_key", "")?
            .set_default("api.timeout_seconds", default_api_timeout())?
            .set_default(
                "api.dashboard_timeout_seconds",
                default_dashboard_timeout(),
            )?
            .set_default(
                "api.accept_invalid_certs",
                default_accept_invalid_certs(),
            )?
            .set_default("storage.database_path", default_database_path())?
            .set_default("storage.employees_file", default_employees_file())?
            .set_default(
                "session.consultation_hold_seconds",
                default_consultation_hold(),
            )?
            .set_default(
                "session.removal_silence_seconds",
                default_removal_silence(),
            )?
            .set_default("session.presence_check_seconds", default_presence_check())?
            .set_default(
                "session.processing_guard_seconds",
                default_processing_guard(),
            )?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with POINTEUSE_ prefix
            .add_source(Environment::with_prefix("POINTEUSE").separator("_"))
            .build()?;

        let config: PointeuseConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.reader.backend.as_str() {
            "auto" | "serial" | "pcsc" => {}
            other => {
                return Err(ConfigError::Message(format!(
                    "Unknown reader backend {other:?} (expected auto, serial or pcsc)"
                )));
            }
        }

        if self.reader.baud_rate == 0 {
            return Err(ConfigError::Message(
                "Reader baud rate must be greater than 0".to_string(),
            ));
        }

        // The application cannot start without a remote store to submit to.
        if self.api.url.is_empty() {
            return Err(ConfigError::Message(
                "API url must be configured".to_string(),
            ));
        }

        if self.api.account_id <= 0 {
            return Err(ConfigError::Message(
                "API account_id must be configured".to_string(),
            ));
        }

        if self.api.timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "API timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.session.consultation_hold_seconds == 0 {
            return Err(ConfigError::Message(
                "Session consultation_hold_seconds must be greater than 0".to_string(),
            ));
        }

        if self.session.removal_silence_seconds == 0 {
            return Err(ConfigError::Message(
                "Session removal_silence_seconds must be greater than 0".to_string(),
            ));
        }

        if self.session.presence_check_seconds == 0 {
            return Err(ConfigError::Message(
                "Session presence_check_seconds must be greater than 0".to_string(),
            ));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for PointeuseConfig {
    fn default() -> Self {
        Self {
            reader: ReaderConfig {
                backend: default_reader_backend(),
                serial_port: String::new(),
                baud_rate: default_baud_rate(),
                pcsc_reader_index: 0,
            },
            api: ApiConfig {
                url: String::new(),
                account_id: 0,
                api_key: String::new(),
                timeout_seconds: default_api_timeout(),
                dashboard_timeout_seconds: default_dashboard_timeout(),
                accept_invalid_certs: default_accept_invalid_certs(),
            },
            storage: StorageConfig {
                database_path: default_database_path(),
                employees_file: default_employees_file(),
            },
            session: SessionConfig {
                consultation_hold_seconds: default_consultation_hold(),
                removal_silence_seconds: default_removal_silence(),
                presence_check_seconds: default_presence_check(),
                processing_guard_seconds: default_processing_guard(),
            },
            system: SystemConfig {
                event_bus_capacity: default_event_bus_capacity(),
            },
        }
    }
}

// Default value functions
fn default_reader_backend() -> String {
    "auto".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}

fn default_api_timeout() -> u64 {
    5
}
fn default_dashboard_timeout() -> u64 {
    10
}
fn default_accept_invalid_certs() -> bool {
    true
}

fn default_database_path() -> String {
    "pointeuse.db".to_string()
}
fn default_employees_file() -> String {
    "employees.json".to_string()
}

fn default_consultation_hold() -> u64 {
    5
}
fn default_removal_silence() -> u64 {
    2
}
fn default_presence_check() -> u64 {
    2
}
fn default_processing_guard() -> u64 {
    3
}

fn default_event_bus_capacity() -> usize {
    100
}
