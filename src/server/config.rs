//! Process-level settings for the relay binary.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `RELAY_STATE_DIR` | root of the durable state store | `./relay-state` |
//! | `RELAY_OUTBOX_DIR` | where delivered batches are appended | `./relay-outbox` |
//! | `RELAY_LISTEN_ADDR` | HTTP listen address | `0.0.0.0:3000` |
//! | `RELAY_MAX_REDELIVERIES` | refusals before the ledger reports its limit | 5 |
//!
//! Unlike the tuning knobs in [`RelayConfig`](crate::config::RelayConfig),
//! a bad value here fails startup.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::collaborators::ledger::DEFAULT_MAX_REDELIVERIES;

const DEFAULT_STATE_DIR: &str = "./relay-state";
const DEFAULT_OUTBOX_DIR: &str = "./relay-outbox";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Errors in process-level settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{variable} is not a valid socket address: {value:?}")]
    InvalidAddress {
        variable: &'static str,
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("{variable} is not a valid number: {value:?}")]
    InvalidNumber {
        variable: &'static str,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("{variable} must not be empty")]
    Empty { variable: &'static str },
}

/// Settings the binary needs before it can build a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub state_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub max_redeliveries: u32,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let dir = |variable: &'static str, default: &str| match lookup(variable) {
            Some(value) if value.trim().is_empty() => Err(ConfigError::Empty { variable }),
            Some(value) => Ok(PathBuf::from(value)),
            None => Ok(PathBuf::from(default)),
        };

        let listen = lookup("RELAY_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen
            .trim()
            .parse::<SocketAddr>()
            .map_err(|source| ConfigError::InvalidAddress {
                variable: "RELAY_LISTEN_ADDR",
                value: listen.clone(),
                source,
            })?;

        let max_redeliveries = match lookup("RELAY_MAX_REDELIVERIES") {
            Some(value) => value
                .trim()
                .parse::<u32>()
                .map_err(|source| ConfigError::InvalidNumber {
                    variable: "RELAY_MAX_REDELIVERIES",
                    value: value.clone(),
                    source,
                })?,
            None => DEFAULT_MAX_REDELIVERIES,
        };

        Ok(ServerConfig {
            state_dir: dir("RELAY_STATE_DIR", DEFAULT_STATE_DIR)?,
            outbox_dir: dir("RELAY_OUTBOX_DIR", DEFAULT_OUTBOX_DIR)?,
            listen_addr,
            max_redeliveries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ServerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("./relay-state"));
        assert_eq!(config.outbox_dir, PathBuf::from("./relay-outbox"));
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.max_redeliveries, DEFAULT_MAX_REDELIVERIES);
    }

    #[test]
    fn values_are_read() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("RELAY_STATE_DIR", "/var/lib/relay"),
            ("RELAY_LISTEN_ADDR", "127.0.0.1:8080"),
            ("RELAY_MAX_REDELIVERIES", "9"),
        ]))
        .unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/relay"));
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.max_redeliveries, 9);
    }

    #[test]
    fn bad_address_is_rejected() {
        let error = ServerConfig::from_lookup(lookup_from(&[("RELAY_LISTEN_ADDR", "localhost")]))
            .unwrap_err();
        assert!(matches!(error, ConfigError::InvalidAddress { .. }));
    }

    #[test]
    fn bad_number_is_rejected() {
        let error = ServerConfig::from_lookup(lookup_from(&[("RELAY_MAX_REDELIVERIES", "many")]))
            .unwrap_err();
        assert!(matches!(error, ConfigError::InvalidNumber { .. }));
    }

    #[test]
    fn empty_directory_is_rejected() {
        let error =
            ServerConfig::from_lookup(lookup_from(&[("RELAY_OUTBOX_DIR", " ")])).unwrap_err();
        assert!(matches!(error, ConfigError::Empty { variable: "RELAY_OUTBOX_DIR" }));
    }
}
