//! Configuration module for the uplink agent.
//!
//! Settings come from environment variables, optionally layered over a JSON
//! broker file (`{"broker": .., "port": .., "id": ..}`).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default MQTT broker host
const DEFAULT_BROKER_HOST: &str = "localhost";

/// Default MQTT broker port
const DEFAULT_BROKER_PORT: u16 = 1883;

/// Default device id (device name becomes `iot1`)
const DEFAULT_DEVICE_ID: &str = "1";

/// Default seconds between pictures
const DEFAULT_IMAGE_INTERVAL_SECS: u64 = 600;

/// Default seconds between sensor readings
const DEFAULT_SENSOR_INTERVAL_SECS: u64 = 60;

const DEFAULT_QUEUE_DIR: &str = "cache";
const DEFAULT_IMAGE_PATH: &str = "picture.jpg";

const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// Reconnect backoff: 1s base, 32s cap, reset after 20s of stable connection
const DEFAULT_RECONNECT_BASE_SECS: u64 = 1;
const DEFAULT_RECONNECT_MAX_SECS: u64 = 32;
const DEFAULT_RECONNECT_STABLE_SECS: u64 = 20;

/// Capture intervals shorter than this would collide on the minute key
const MIN_CAPTURE_INTERVAL_SECS: u64 = 60;

/// Upper bound for any interval setting (one day)
const MAX_INTERVAL_SECS: u64 = 86_400;

/// Default MQTT packet size limit, large enough for full-resolution JPEGs
const DEFAULT_MAX_PACKET_BYTES: usize = 8 * 1024 * 1024;

const MIN_MAX_PACKET_BYTES: usize = 16 * 1024;

/// Largest remaining length the MQTT wire format can express
const MQTT_PACKET_LIMIT: usize = 268_435_455;

/// Configuration for the uplink agent.
///
/// Environment variables:
/// - `UPLINK_CONFIG_FILE`: JSON file with `broker`, `port`, `id` defaults
/// - `UPLINK_BROKER_HOST` / `UPLINK_BROKER_PORT`: MQTT broker (default: localhost:1883)
/// - `UPLINK_DEVICE_ID`: device id, device name is `iot{id}` (default: 1)
/// - `UPLINK_USERNAME` / `UPLINK_PASSWORD`: optional broker credentials
/// - `UPLINK_IMAGE_INTERVAL_SECS`: seconds between pictures (default: 600)
/// - `UPLINK_SENSOR_INTERVAL_SECS`: seconds between sensor readings (default: 60)
/// - `UPLINK_QUEUE_DIR`: durable queue directory (default: cache)
/// - `UPLINK_IMAGE_PATH`: file the camera writes to (default: picture.jpg)
/// - `UPLINK_CAPTURE_COMMAND`: optional shell command run before each picture
/// - `UPLINK_PUBLISH_TIMEOUT_SECS`: publish acknowledgement timeout (default: 10)
/// - `UPLINK_KEEP_ALIVE_SECS`: MQTT keep-alive (default: 30)
/// - `UPLINK_RECONNECT_BASE_SECS` / `UPLINK_RECONNECT_MAX_SECS`: backoff bounds (default: 1 / 32)
/// - `UPLINK_RECONNECT_STABLE_SECS`: uptime after which backoff resets (default: 20)
/// - `UPLINK_MAX_PACKET_BYTES`: largest MQTT packet sent or accepted (default: 8 MiB)
#[derive(Debug, Clone)]
pub struct Config {
    pub broker_host: String,
    pub broker_port: u16,
    pub device_id: String,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Period of the image producer
    pub image_interval: Duration,

    /// Period of the sensor producer
    pub sensor_interval: Duration,

    /// Root directory of the durable queue
    pub queue_dir: PathBuf,

    pub image_path: PathBuf,
    pub capture_command: Option<String>,

    /// How long a publish may wait for the broker's acknowledgement
    pub publish_timeout: Duration,

    pub keep_alive: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub reconnect_stable: Duration,

    /// MQTT packet size limit in both directions. Images base64-encode into
    /// the message, so this must exceed the largest picture by about a third.
    pub max_packet_size: usize,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Broker defaults read from `UPLINK_CONFIG_FILE`.
#[derive(Debug, Default, Deserialize)]
struct BrokerFile {
    broker: Option<String>,
    port: Option<u16>,
    id: Option<serde_json::Value>,
}

impl BrokerFile {
    fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::for_var("UPLINK_CONFIG_FILE", format!("cannot read '{}': {}", path, e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            ConfigError::for_var("UPLINK_CONFIG_FILE", format!("invalid JSON in '{}': {}", path, e))
        })
    }

    fn device_id(&self) -> Option<String> {
        match &self.id {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is not a valid number, is outside
    /// its allowed range, or the broker file cannot be read.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use uplink_agent::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Broker: {}:{}", config.broker_host, config.broker_port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match env::var("UPLINK_CONFIG_FILE") {
            Ok(path) => BrokerFile::load(&path)?,
            Err(_) => BrokerFile::default(),
        };

        let broker_host = env::var("UPLINK_BROKER_HOST")
            .ok()
            .or_else(|| file.broker.clone())
            .unwrap_or_else(|| DEFAULT_BROKER_HOST.to_string());

        let broker_port = match env::var("UPLINK_BROKER_PORT") {
            Ok(value) => Self::parse_port(&value)?,
            Err(_) => file.port.unwrap_or(DEFAULT_BROKER_PORT),
        };

        let device_id = env::var("UPLINK_DEVICE_ID")
            .ok()
            .or_else(|| file.device_id())
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());

        let image_interval = Self::parse_secs(
            "UPLINK_IMAGE_INTERVAL_SECS",
            DEFAULT_IMAGE_INTERVAL_SECS,
            MIN_CAPTURE_INTERVAL_SECS,
        )?;
        let sensor_interval = Self::parse_secs(
            "UPLINK_SENSOR_INTERVAL_SECS",
            DEFAULT_SENSOR_INTERVAL_SECS,
            MIN_CAPTURE_INTERVAL_SECS,
        )?;
        let publish_timeout =
            Self::parse_secs("UPLINK_PUBLISH_TIMEOUT_SECS", DEFAULT_PUBLISH_TIMEOUT_SECS, 1)?;
        let keep_alive = Self::parse_secs("UPLINK_KEEP_ALIVE_SECS", DEFAULT_KEEP_ALIVE_SECS, 5)?;
        let reconnect_base =
            Self::parse_secs("UPLINK_RECONNECT_BASE_SECS", DEFAULT_RECONNECT_BASE_SECS, 1)?;
        let reconnect_max =
            Self::parse_secs("UPLINK_RECONNECT_MAX_SECS", DEFAULT_RECONNECT_MAX_SECS, 1)?;
        let reconnect_stable =
            Self::parse_secs("UPLINK_RECONNECT_STABLE_SECS", DEFAULT_RECONNECT_STABLE_SECS, 0)?;

        let max_packet_size = match env::var("UPLINK_MAX_PACKET_BYTES") {
            Ok(value) => Self::parse_packet_size(&value)?,
            Err(_) => DEFAULT_MAX_PACKET_BYTES,
        };

        if reconnect_max < reconnect_base {
            return Err(ConfigError::for_var(
                "UPLINK_RECONNECT_MAX_SECS",
                format!(
                    "maximum backoff {}s is below base backoff {}s",
                    reconnect_max.as_secs(),
                    reconnect_base.as_secs()
                ),
            ));
        }

        Ok(Self {
            broker_host,
            broker_port,
            device_id,
            username: non_empty_var("UPLINK_USERNAME"),
            password: non_empty_var("UPLINK_PASSWORD"),
            image_interval,
            sensor_interval,
            queue_dir: env::var("UPLINK_QUEUE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_QUEUE_DIR)),
            image_path: env::var("UPLINK_IMAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_IMAGE_PATH)),
            capture_command: non_empty_var("UPLINK_CAPTURE_COMMAND"),
            publish_timeout,
            keep_alive,
            reconnect_base,
            reconnect_max,
            reconnect_stable,
            max_packet_size,
        })
    }

    /// Device name used as MQTT client id and topic prefix.
    pub fn device_name(&self) -> String {
        format!("iot{}", self.device_id)
    }

    fn parse_port(value: &str) -> Result<u16, ConfigError> {
        let env_var = "UPLINK_BROKER_PORT";
        let port: u16 = value
            .parse()
            .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid port", value)))?;
        if port == 0 {
            return Err(ConfigError::for_var(env_var, "port must be greater than 0"));
        }
        Ok(port)
    }

    fn parse_packet_size(value: &str) -> Result<usize, ConfigError> {
        let env_var = "UPLINK_MAX_PACKET_BYTES";
        let bytes: usize = value.parse().map_err(|_| {
            ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
        })?;
        if !(MIN_MAX_PACKET_BYTES..=MQTT_PACKET_LIMIT).contains(&bytes) {
            return Err(ConfigError::for_var(
                env_var,
                format!(
                    "{} bytes is outside {}..={}",
                    bytes, MIN_MAX_PACKET_BYTES, MQTT_PACKET_LIMIT
                ),
            ));
        }
        Ok(bytes)
    }

    /// Parse a duration in whole seconds with range validation.
    fn parse_secs(env_var: &str, default: u64, min: u64) -> Result<Duration, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let secs: u64 = value.parse().map_err(|_| {
                    ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
                })?;

                if secs < min {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!("{}s is below minimum ({}s)", secs, min),
                    ));
                }

                if secs > MAX_INTERVAL_SECS {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!("{}s exceeds maximum ({}s)", secs, MAX_INTERVAL_SECS),
                    ));
                }

                Ok(Duration::from_secs(secs))
            }
            Err(_) => Ok(Duration::from_secs(default)),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl Default for Config {
    /// Default configuration, useful for tests.
    fn default() -> Self {
        Self {
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            device_id: DEFAULT_DEVICE_ID.to_string(),
            username: None,
            password: None,
            image_interval: Duration::from_secs(DEFAULT_IMAGE_INTERVAL_SECS),
            sensor_interval: Duration::from_secs(DEFAULT_SENSOR_INTERVAL_SECS),
            queue_dir: PathBuf::from(DEFAULT_QUEUE_DIR),
            image_path: PathBuf::from(DEFAULT_IMAGE_PATH),
            capture_command: None,
            publish_timeout: Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            reconnect_base: Duration::from_secs(DEFAULT_RECONNECT_BASE_SECS),
            reconnect_max: Duration::from_secs(DEFAULT_RECONNECT_MAX_SECS),
            reconnect_stable: Duration::from_secs(DEFAULT_RECONNECT_STABLE_SECS),
            max_packet_size: DEFAULT_MAX_PACKET_BYTES,
        }
    }
}
