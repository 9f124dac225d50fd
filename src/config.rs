use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::topic;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("No listeners configured")]
    NoListeners,
    #[error("Listener '{listener}': invalid bind value '{bind}'")]
    InvalidBind { listener: String, bind: String },
    #[error("Listener '{listener}': invalid port value in bind value '{bind}'")]
    InvalidPort { listener: String, bind: String },
    #[error("Listener '{listener}': '{field}' configuration parameter missing")]
    MissingTlsParameter { listener: String, field: &'static str },
    #[error("Listener '{listener}': can't load TLS material: {reason}")]
    Tls { listener: String, reason: String },
    #[error("Access rule for '{identity}' has invalid filter '{filter}'")]
    InvalidAclFilter { identity: String, filter: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named network listeners (default: one plain TCP listener on 0.0.0.0:1883)
    #[serde(default = "default_listeners")]
    pub listeners: BTreeMap<String, ListenerConfig>,

    /// Keep-alive applied when a client asks for none (default: 60)
    #[serde(default = "default_keep_alive_secs")]
    pub default_keep_alive_secs: u16,

    /// Time allowed between accept and a complete CONNECT (default: 10)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Interval between $SYS publications, 0 disables them (default: 10)
    #[serde(default = "default_sys_interval_secs")]
    pub sys_interval_secs: u64,

    /// Largest accepted packet in bytes, 0 means protocol maximum (default: 1 MiB)
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Maximum number of retained messages (default: 10000)
    #[serde(default = "default_retained_message_limit")]
    pub retained_message_limit: usize,

    /// Maximum retransmission attempts for QoS=1/2 (default: 10)
    #[serde(default = "default_max_retransmission_limit")]
    pub max_retransmission_limit: u32,

    /// Retransmission interval in milliseconds (default: 5000)
    #[serde(default = "default_retransmission_interval_ms")]
    pub retransmission_interval_ms: u64,

    /// Unacknowledged outbound QoS=1/2 messages per session (default: 32)
    #[serde(default = "default_max_inflight_messages")]
    pub max_inflight_messages: usize,

    /// Queued outbound messages per session (default: 1000)
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Published messages waiting for the dispatcher (default: 10000)
    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,

    /// Time to wait for connections to close on shutdown (default: 5)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Topic access control
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listeners() -> BTreeMap<String, ListenerConfig> {
    let mut listeners = BTreeMap::new();
    listeners.insert("default".to_string(), ListenerConfig::tcp("0.0.0.0:1883"));
    listeners
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_sys_interval_secs() -> u64 {
    10
}

fn default_max_packet_size() -> usize {
    1024 * 1024
}

fn default_retained_message_limit() -> usize {
    10000
}

fn default_max_retransmission_limit() -> u32 {
    10
}

fn default_retransmission_interval_ms() -> u64 {
    5000
}

fn default_max_inflight_messages() -> usize {
    32
}

fn default_outbound_queue_capacity() -> usize {
    1000
}

fn default_dispatch_queue_capacity() -> usize {
    10000
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listeners: default_listeners(),
            default_keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            sys_interval_secs: default_sys_interval_secs(),
            max_packet_size: default_max_packet_size(),
            retained_message_limit: default_retained_message_limit(),
            max_retransmission_limit: default_max_retransmission_limit(),
            retransmission_interval_ms: default_retransmission_interval_ms(),
            max_inflight_messages: default_max_inflight_messages(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            dispatch_queue_capacity: default_dispatch_queue_capacity(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything that can be checked without touching the network
    /// or the file system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        for (name, listener) in &self.listeners {
            listener.bind_address(name)?;
            if listener.uses_tls() {
                if listener.certfile.is_none() {
                    return Err(ConfigError::MissingTlsParameter {
                        listener: name.clone(),
                        field: "certfile",
                    });
                }
                if listener.keyfile.is_none() {
                    return Err(ConfigError::MissingTlsParameter {
                        listener: name.clone(),
                        field: "keyfile",
                    });
                }
            }
        }

        for (identity, filters) in &self.auth.acl {
            for filter in filters {
                if topic::validate_topic_filter(filter).is_err() {
                    return Err(ConfigError::InvalidAclFilter {
                        identity: identity.clone(),
                        filter: filter.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Replaces all listeners with a single plain TCP listener on `bind`.
    pub fn with_single_listener(mut self, bind: &str) -> Self {
        self.listeners.clear();
        self.listeners.insert("default".to_string(), ListenerConfig::tcp(bind));
        self
    }

    /// Get the retransmission interval with protection (minimum 500ms, None means disabled)
    pub fn retransmission_interval(&self) -> Option<Duration> {
        if self.retransmission_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.retransmission_interval_ms.max(500)))
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn sys_interval(&self) -> Option<Duration> {
        (self.sys_interval_secs > 0).then(|| Duration::from_secs(self.sys_interval_secs))
    }

    /// Time without inbound traffic after which a connection is dropped:
    /// one and a half times the effective keep-alive.
    pub fn keep_alive_timeout(&self, client_keep_alive: u16) -> Duration {
        let keep_alive = if client_keep_alive == 0 {
            self.default_keep_alive_secs
        } else {
            client_keep_alive
        };
        Duration::from_millis(u64::from(keep_alive.max(1)) * 1500)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    #[default]
    Tcp,
    Tls,
    Ws,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Transport: "tcp", "tls" or "ws" (default: "tcp")
    #[serde(rename = "type", default)]
    pub kind: ListenerKind,

    /// "<address>:<port>", split at the last colon so ":::1883" binds [::]:1883
    pub bind: String,

    /// Maximum concurrent connections, -1 means unlimited (default: -1)
    #[serde(default = "default_max_connections")]
    pub max_connections: i64,

    /// Wrap the transport in TLS; implied by type = "tls". Accepts a
    /// boolean or "on"/"off".
    #[serde(default, deserialize_with = "deserialize_switch")]
    pub ssl: bool,

    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,

    /// CA bundle used to verify optional client certificates
    pub cafile: Option<PathBuf>,
}

fn default_max_connections() -> i64 {
    -1
}

fn deserialize_switch<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Switch {
        Flag(bool),
        Word(String),
    }

    match Switch::deserialize(deserializer)? {
        Switch::Flag(flag) => Ok(flag),
        Switch::Word(word) => match word.to_ascii_lowercase().as_str() {
            "on" | "true" => Ok(true),
            "off" | "false" => Ok(false),
            _ => Err(serde::de::Error::custom(format!(
                "expected a boolean or \"on\"/\"off\", got \"{word}\""
            ))),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for BindAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl ListenerConfig {
    pub fn tcp(bind: &str) -> Self {
        Self {
            kind: ListenerKind::Tcp,
            bind: bind.to_string(),
            max_connections: default_max_connections(),
            ssl: false,
            certfile: None,
            keyfile: None,
            cafile: None,
        }
    }

    pub fn uses_tls(&self) -> bool {
        self.kind == ListenerKind::Tls || self.ssl
    }

    pub fn connection_limit(&self) -> Option<usize> {
        usize::try_from(self.max_connections).ok()
    }

    pub fn bind_address(&self, listener: &str) -> Result<BindAddress, ConfigError> {
        let (host, port) = self
            .bind
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidBind {
                listener: listener.to_string(),
                bind: self.bind.clone(),
            })?;

        let port = port.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
            listener: listener.to_string(),
            bind: self.bind.clone(),
        })?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "0.0.0.0" } else { host };

        Ok(BindAddress {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Enforce the access control table (default: false, everything allowed)
    #[serde(default)]
    pub topic_check: bool,

    /// Identity (username or "anonymous") -> permitted topic filters
    #[serde(default = "default_acl")]
    pub acl: HashMap<String, Vec<String>>,
}

fn default_acl() -> HashMap<String, Vec<String>> {
    let mut acl = HashMap::new();
    acl.insert("anonymous".to_string(), vec!["#".to_string()]);
    acl
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            topic_check: false,
            acl: default_acl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter, overridden by RUST_LOG (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
