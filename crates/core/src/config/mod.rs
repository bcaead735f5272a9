use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lifetime of a user stream session key without a refresh.
pub const SESSION_KEY_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub rest: RestConfig,
    pub websocket: WebSocketConfig,
    pub user_stream: UserStreamConfig,
    #[serde(default)]
    pub streams: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Endpoint paths are joined onto this, so it must end with `/`.
    pub base_url: String,
    pub recv_window_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Combined-stream endpoint, e.g. `wss://fstream.binance.com/stream`.
    pub market_url: String,
    /// Raw-stream endpoint, the session key is appended as a path segment.
    pub user_url: String,
    pub connect_timeout_ms: u64,
    /// Minimum spacing between outbound control frames.
    pub control_interval_ms: u64,
    /// A socket that receives nothing, server pings included, for this
    /// long is treated as lost. Zero disables the check.
    #[serde(default = "default_read_idle_timeout_ms")]
    pub read_idle_timeout_ms: u64,
}

fn default_read_idle_timeout_ms() -> u64 {
    10 * 60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStreamConfig {
    pub keepalive_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Per-stream queue bound. `None` keeps queues unbounded.
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Daily-rolling log file; console only when unset.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl GatewayConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("TRADEGATE").separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Layers the given files, missing ones skipped, over the production
    /// defaults and then the environment.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let defaults = Config::try_from(&Self::binance_futures())?;
        let mut builder = Config::builder().add_source(defaults);

        for path in paths {
            builder = builder.add_source(File::from(path.as_ref()).required(false));
        }

        let settings = builder
            .add_source(Environment::with_prefix("TRADEGATE").separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.user_stream.validate()
    }

    pub fn binance_futures() -> Self {
        Self {
            rest: RestConfig {
                base_url: "https://fapi.binance.com/fapi/v1/".to_string(),
                recv_window_ms: 10_000,
                timeout_ms: 10_000,
            },
            websocket: WebSocketConfig {
                market_url: "wss://fstream.binance.com/stream".to_string(),
                user_url: "wss://fstream.binance.com/ws".to_string(),
                connect_timeout_ms: 10_000,
                control_interval_ms: 100,
                read_idle_timeout_ms: default_read_idle_timeout_ms(),
            },
            user_stream: UserStreamConfig {
                keepalive_interval_secs: 30 * 60,
            },
            streams: StreamConfig::default(),
            logging: LoggingConfig::default(),
            credentials: None,
        }
    }

    pub fn binance_futures_testnet() -> Self {
        let mut config = Self::binance_futures();
        config.rest.base_url = "https://testnet.binancefuture.com/fapi/v1/".to_string();
        config.websocket.market_url = "wss://stream.binancefuture.com/stream".to_string();
        config.websocket.user_url = "wss://stream.binancefuture.com/ws".to_string();
        config.logging.level = "debug".to_string();
        config
    }

    pub fn with_credentials(mut self, api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
        });
        self
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::binance_futures()
    }
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl WebSocketConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.read_idle_timeout_ms)
    }
}

impl UserStreamConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// The key must be refreshed at a nonzero period shorter than its TTL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.keepalive_interval();
        if interval.is_zero() || interval >= SESSION_KEY_TTL {
            return Err(ConfigError::Message(format!(
                "user_stream.keepalive_interval_secs must be between 1 and {}, got {}",
                SESSION_KEY_TTL.as_secs() - 1,
                self.keepalive_interval_secs
            )));
        }
        Ok(())
    }
}
