use std::env;

use crate::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;

/// Where new connections are opened. Only built through [`Config::new`], so the port is
/// never 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    host: String,
    port: u16,
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Config, Error> {
        if port == 0 {
            return Err(Error::InvalidPort(port));
        }

        Ok(Config {
            host: host.into(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Reads `REDIS_HOST` and `REDIS_PORT`, falling back to the defaults when unset.
    pub fn from_env() -> Result<Config, Error> {
        let host = env::var("REDIS_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = match env::var("REDIS_PORT") {
            Ok(port) => port
                .parse::<u16>()
                .map_err(|_| Error::InvalidArgument(format!("REDIS_PORT={}", port)))?,
            Err(_) => DEFAULT_PORT,
        };

        Config::new(host, port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_loopback() {
        let config = Config::default();

        assert_eq!(config.host(), "127.0.0.1");
        assert_eq!(config.port(), 6379);
    }

    #[test]
    fn rejects_port_zero() {
        assert!(matches!(
            Config::new("localhost", 0),
            Err(Error::InvalidPort(0))
        ));
        assert!(Config::new("localhost", 65535).is_ok());
    }
}
