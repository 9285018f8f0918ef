use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Server settings, read from `EMBER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Sessions idle longer than this stop working.
    pub session_ttl: Duration,
    /// Users silent longer than this are swept offline.
    pub presence_staleness: Duration,
    pub catchup_cap: usize,
    pub idle_timeout: Duration,
    pub auth_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            db_path: lookup("EMBER_DB_PATH")
                .unwrap_or_else(|| "ember.db".into())
                .into(),
            host: lookup("EMBER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&lookup, "EMBER_PORT", 3000)?,
            session_ttl: Duration::from_secs(
                parse::<u64>(&lookup, "EMBER_SESSION_TTL_HOURS", 720)?.saturating_mul(3600),
            ),
            presence_staleness: Duration::from_secs(parse(&lookup, "EMBER_PRESENCE_STALE_SECS", 90)?),
            catchup_cap: parse(&lookup, "EMBER_CATCHUP_CAP", 100)?,
            idle_timeout: Duration::from_secs(parse(&lookup, "EMBER_IDLE_TIMEOUT_SECS", 60)?),
            auth_timeout: Duration::from_secs(parse(&lookup, "EMBER_AUTH_TIMEOUT_SECS", 5)?),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session_ttl.is_zero() {
            bail!("EMBER_SESSION_TTL_HOURS must be at least 1");
        }
        if self.presence_staleness < Duration::from_secs(3) {
            bail!("EMBER_PRESENCE_STALE_SECS must be at least 3");
        }
        if self.catchup_cap == 0 {
            bail!("EMBER_CATCHUP_CAP must be at least 1");
        }
        if self.idle_timeout < Duration::from_secs(3) {
            bail!("EMBER_IDLE_TIMEOUT_SECS must be at least 3");
        }
        // Pongs refresh presence once per ping.
        if self.presence_staleness <= self.heartbeat_interval() {
            bail!(
                "EMBER_PRESENCE_STALE_SECS must exceed the ping interval of {}s",
                self.heartbeat_interval().as_secs()
            );
        }
        if self.auth_timeout.is_zero() {
            bail!("EMBER_AUTH_TIMEOUT_SECS must be at least 1");
        }
        Ok(())
    }

    /// Server pings three times per idle window.
    pub fn heartbeat_interval(&self) -> Duration {
        self.idle_timeout / 3
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key}={raw:?} is not valid")),
        None => Ok(default),
    }
}
