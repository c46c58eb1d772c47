//! Cablegram configuration
//!
//! Configuration comes from environment variables with the `CABLEGRAM_`
//! prefix. Only the auth secret is required; everything else has defaults.

use std::net::SocketAddr;

/// Cablegram configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the gateway listener binds to (default: 127.0.0.1:9400)
    pub bind_addr: SocketAddr,
    /// HMAC secret used to verify bearer tokens
    pub auth_secret: String,
    /// PostgreSQL connection string (postgres backend only)
    pub database_url: Option<String>,
    /// Heartbeat interval in seconds (default: 15)
    pub ping_interval: u64,
    /// Seconds of inactivity before an Online user is demoted to Away
    /// (default: 300)
    pub idle_after_secs: u64,
    /// Interval between idle sweeps in seconds (default: 60)
    pub sweep_interval_secs: u64,
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let auth_secret = lookup("CABLEGRAM_AUTH_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingEnv("CABLEGRAM_AUTH_SECRET"))?;

        let bind_addr = match lookup("CABLEGRAM_BIND_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("CABLEGRAM_BIND_ADDR", "expected host:port"))?,
            None => SocketAddr::from(([127, 0, 0, 1], 9400)),
        };

        let database_url = lookup("CABLEGRAM_DATABASE_URL").filter(|s| !s.is_empty());

        Ok(Self {
            bind_addr,
            auth_secret,
            database_url,
            ping_interval: parse_secs(&lookup, "CABLEGRAM_PING_INTERVAL", 15)?,
            idle_after_secs: parse_secs(&lookup, "CABLEGRAM_IDLE_AFTER_SECS", 300)?,
            sweep_interval_secs: parse_secs(&lookup, "CABLEGRAM_SWEEP_INTERVAL_SECS", 60)?,
        })
    }
}

fn parse_secs<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidEnv(name, "expected seconds as u64")),
        None => Ok(default),
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
