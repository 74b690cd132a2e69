//! Support desk configuration

use std::net::SocketAddr;

use agentflow_durable::RuntimeConfig;

/// Default listen address
pub const DEFAULT_ADDR: &str = "0.0.0.0:9100";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid SUPPORT_DESK_ADDR {value:?}: {source}")]
    InvalidAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Support desk service configuration
#[derive(Debug, Clone)]
pub struct SupportDeskConfig {
    /// HTTP listen address
    pub addr: SocketAddr,

    /// PostgreSQL URL; history stays in memory when unset
    pub database_url: Option<String>,

    /// Engine settings
    pub runtime: RuntimeConfig,
}

impl Default for SupportDeskConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            database_url: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl SupportDeskConfig {
    /// Load configuration from environment variables
    ///
    /// - `SUPPORT_DESK_ADDR`: listen address (default `0.0.0.0:9100`)
    /// - `DATABASE_URL`: use PostgreSQL for history when set
    /// - `DURABLE_*`: engine settings, see [`RuntimeConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_addr =
            std::env::var("SUPPORT_DESK_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let addr = raw_addr
            .parse()
            .map_err(|source| ConfigError::InvalidAddr {
                value: raw_addr.clone(),
                source,
            })?;

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        Ok(Self {
            addr,
            database_url,
            runtime: RuntimeConfig::from_env(),
        })
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupportDeskConfig::default();
        assert_eq!(config.addr.to_string(), DEFAULT_ADDR);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_builder() {
        let config = SupportDeskConfig::default()
            .with_addr("127.0.0.1:8080".parse().unwrap())
            .with_database_url("postgres://localhost/support");
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/support"));
    }

    #[test]
    fn test_invalid_addr_message() {
        let err = ConfigError::InvalidAddr {
            value: "nope".to_string(),
            source: "nope".parse::<SocketAddr>().unwrap_err(),
        };
        assert!(err.to_string().starts_with("invalid SUPPORT_DESK_ADDR \"nope\""));
    }
}
