//! Server and session configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

use crate::console::CvarRegistry;

pub const MIN_PLAYERS: usize = 1;
pub const MAX_PLAYERS: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("expected max players between {MIN_PLAYERS} and {MAX_PLAYERS}, got {0}")]
    MaxPlayersOutOfRange(usize),
    #[error("max players may only be changed while the server is idle")]
    NotIdle,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

pub fn check_max_players(max_players: usize) -> Result<(), ConfigError> {
    if (MIN_PLAYERS..=MAX_PLAYERS).contains(&max_players) {
        Ok(())
    } else {
        Err(ConfigError::MaxPlayersOutOfRange(max_players))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address both the rendezvous socket and the session sockets bind to
    pub host: IpAddr,
    pub port: u16,
    pub max_players: usize,
    /// Idle time after which a session is dropped
    pub message_timeout: Duration,
    /// Interval at which sessions run their queued instructions
    pub tick_interval: Duration,
    /// Read deadline on the rendezvous socket
    pub control_read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            max_players: 1,
            message_timeout: Duration::from_secs(300),
            tick_interval: Duration::from_millis(50),
            control_read_timeout: Duration::from_millis(200),
        }
    }
}

fn positive_secs(value: Option<f64>) -> Option<Duration> {
    value
        .filter(|v| *v > 0.0)
        .and_then(|v| Duration::try_from_secs_f64(v).ok())
}

impl ServerConfig {
    /// Defaults overridden by `net_messagetimeout`, `sys_ticrate` and
    /// `maxplayers` where those are registered.
    pub fn from_cvars(cvars: &CvarRegistry) -> Self {
        let mut config = Self::default();
        if let Some(timeout) = positive_secs(cvars.get_float("net_messagetimeout")) {
            config.message_timeout = timeout;
        }
        if let Some(tick) = positive_secs(cvars.get_float("sys_ticrate")) {
            config.tick_interval = tick;
        }
        if let Some(players) = cvars.get_float("maxplayers").filter(|v| *v >= 1.0) {
            config.max_players = players as usize;
        }
        config
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_max_players(self.max_players)?;
        if self.message_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("message timeout"));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("tick interval"));
        }
        if self.control_read_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("control read timeout"));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.host,
            message_timeout: self.message_timeout,
            tick_interval: self.tick_interval,
        }
    }
}

/// The part of the configuration each session needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub host: IpAddr,
    pub message_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        ServerConfig::default().session_config()
    }
}
