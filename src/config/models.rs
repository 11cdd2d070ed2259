// src/config/models.rs
use crate::load_balancer::LoadBalancerPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for every millisecond setting (one day).
pub const MAX_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NonPositive(&'static str),

    #[error(transparent)]
    Policy(#[from] crate::load_balancer::LoadBalancerError),

    #[error("{field} must not exceed {max}")]
    TooLarge { field: &'static str, max: u64 },

    #[error("HTTP port {0} collides with the proxy TCP port")]
    PortCollision(u16),

    #[error("Invalid listen address {0}")]
    InvalidAddress(String),

    #[error("Unknown control framing '{0}', expected 'sniff' or 'prefixed'")]
    UnknownFraming(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.validate()?;

        if self.api.enabled {
            if self.api.http_port == self.proxy.tcp_port {
                return Err(ConfigError::PortCollision(self.api.http_port));
            }
            self.api.listen_addr()?;
        }

        Ok(())
    }
}

/// How control envelopes are told apart from forwarded payload on the shared port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlFraming {
    /// One read is one JSON envelope; anything that does not decode is data.
    #[default]
    Sniff,
    /// Envelopes carry a magic tag and a big-endian length before the JSON body.
    Prefixed,
}

impl FromStr for ControlFraming {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sniff" => Ok(ControlFraming::Sniff),
            "prefixed" => Ok(ControlFraming::Prefixed),
            other => Err(ConfigError::UnknownFraming(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_host")]
    pub bind_host: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_lb_policy")]
    pub lb_policy: u8,
    #[serde(default = "default_rw_timeout_ms")]
    pub rw_timeout_ms: u64,
    #[serde(default = "default_print_interval_ms")]
    pub print_interval_ms: u64,
    #[serde(default = "default_heartbeat_keep_alive_ms")]
    pub heartbeat_keep_alive_ms: u64,
    #[serde(default = "default_alive_check_interval_ms")]
    pub alive_check_interval_ms: u64,
    #[serde(default = "default_handle_buffer")]
    pub handle_buffer: usize,
    #[serde(default)]
    pub control_framing: ControlFraming,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: default_proxy_host(),
            tcp_port: default_tcp_port(),
            lb_policy: default_lb_policy(),
            rw_timeout_ms: default_rw_timeout_ms(),
            print_interval_ms: default_print_interval_ms(),
            heartbeat_keep_alive_ms: default_heartbeat_keep_alive_ms(),
            alive_check_interval_ms: default_alive_check_interval_ms(),
            handle_buffer: default_handle_buffer(),
            control_framing: ControlFraming::default(),
        }
    }
}

impl ProxyConfig {
    pub fn rw_timeout(&self) -> Duration {
        Duration::from_millis(self.rw_timeout_ms)
    }

    pub fn print_interval(&self) -> Duration {
        Duration::from_millis(self.print_interval_ms)
    }

    pub fn heartbeat_keep_alive(&self) -> Duration {
        Duration::from_millis(self.heartbeat_keep_alive_ms)
    }

    pub fn alive_check_interval(&self) -> Duration {
        Duration::from_millis(self.alive_check_interval_ms)
    }

    /// Resolve the address the proxy listens on for `port`.
    pub fn listen_addr(&self, port: u16) -> Result<SocketAddr, ConfigError> {
        let host = if self.bind_host == "localhost" {
            "127.0.0.1"
        } else {
            self.bind_host.as_str()
        };

        format!("{}:{}", host, port)
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(format!("{}:{}", self.bind_host, port)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handle_buffer == 0 {
            return Err(ConfigError::NonPositive("handle_buffer"));
        }
        let durations = [
            ("rw_timeout_ms", self.rw_timeout_ms),
            ("print_interval_ms", self.print_interval_ms),
            ("heartbeat_keep_alive_ms", self.heartbeat_keep_alive_ms),
            ("alive_check_interval_ms", self.alive_check_interval_ms),
        ];
        for (field, ms) in durations {
            if ms == 0 {
                return Err(ConfigError::NonPositive(field));
            }
            if ms > MAX_DURATION_MS {
                return Err(ConfigError::TooLarge {
                    field,
                    max: MAX_DURATION_MS,
                });
            }
        }

        LoadBalancerPolicy::from_id(self.lb_policy)?;
        self.listen_addr(self.tcp_port)?;

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_host")]
    pub bind_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_host: default_api_host(),
            http_port: default_http_port(),
        }
    }
}

impl ApiConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_host, self.http_port)
            .parse()
            .map_err(|_| {
                ConfigError::InvalidAddress(format!("{}:{}", self.bind_host, self.http_port))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Values picked up from `TCPLB_*` environment variables.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigOverrides {
    pub bind_host: Option<String>,
    pub tcp_port: Option<u16>,
    pub lb_policy: Option<u8>,
    pub rw_timeout_ms: Option<u64>,
    pub print_interval_ms: Option<u64>,
    pub heartbeat_keep_alive_ms: Option<u64>,
    pub alive_check_interval_ms: Option<u64>,
    pub handle_buffer: Option<usize>,
    pub control_framing: Option<String>,
    pub http_port: Option<u16>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut Config) -> Result<(), ConfigError> {
        let proxy = &mut config.proxy;

        if let Some(host) = self.bind_host {
            proxy.bind_host = host;
        }
        if let Some(port) = self.tcp_port {
            proxy.tcp_port = port;
        }
        if let Some(policy) = self.lb_policy {
            proxy.lb_policy = policy;
        }
        if let Some(ms) = self.rw_timeout_ms {
            proxy.rw_timeout_ms = ms;
        }
        if let Some(ms) = self.print_interval_ms {
            proxy.print_interval_ms = ms;
        }
        if let Some(ms) = self.heartbeat_keep_alive_ms {
            proxy.heartbeat_keep_alive_ms = ms;
        }
        if let Some(ms) = self.alive_check_interval_ms {
            proxy.alive_check_interval_ms = ms;
        }
        if let Some(size) = self.handle_buffer {
            proxy.handle_buffer = size;
        }
        if let Some(framing) = self.control_framing {
            proxy.control_framing = framing.parse()?;
        }
        if let Some(port) = self.http_port {
            config.api.http_port = port;
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_tcp_port() -> u16 {
    8081
}

fn default_http_port() -> u16 {
    8080
}

fn default_lb_policy() -> u8 {
    1
}

fn default_rw_timeout_ms() -> u64 {
    3_000
}

fn default_print_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_keep_alive_ms() -> u64 {
    5_000
}

fn default_alive_check_interval_ms() -> u64 {
    2_500
}

fn default_handle_buffer() -> usize {
    1024
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
