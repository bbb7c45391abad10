//! Change-feed binding configuration.

use crate::metadata::{decode_metadata, parse_duration, Properties};
use crate::{Error, ErrorContext, Result};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 28015;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY_MIN_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Recognised metadata for the change-feed binding.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct StateChangeMetadata {
    /// Address of the database server as `host:port`. The port defaults to 28015.
    pub address: String,
    /// Database that holds the watched table.
    pub database: String,
    /// User to authenticate as.
    pub username: String,
    /// Password for the user. May be empty.
    #[serde(default)]
    pub password: String,
    /// Table whose changes are streamed.
    pub table: String,
    /// Maximum time to establish the connection and authenticate, e.g. `5s`. Defaults to 10s.
    #[serde(default, rename = "connectTimeout")]
    pub connect_timeout: Option<String>,
    /// Additional connection attempts after a failed one. Defaults to 0.
    #[serde(default, rename = "numRetries")]
    pub num_retries: Option<u32>,
}

/// Validated connection settings. Immutable once a session is bound to them.
#[derive(Clone)]
pub struct StateChangeConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub table: String,
    pub connect_timeout: Duration,
    pub num_retries: u32,
}

impl std::fmt::Debug for StateChangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChangeConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("table", &self.table)
            .field("connect_timeout", &self.connect_timeout)
            .field("num_retries", &self.num_retries)
            .finish()
    }
}

fn required(value: &str, field: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::configuration_with_context(
            format!("{} is required", field),
            ErrorContext::new()
                .with_field_path(field)
                .with_source("statechange"),
        ));
    }
    Ok(value.to_string())
}

fn split_address(raw: &str) -> Result<(String, u16)> {
    let invalid = |why: &str| {
        Error::configuration_with_context(
            format!("invalid address \"{}\"", raw),
            ErrorContext::new()
                .with_field_path("address")
                .with_details(why.to_string())
                .with_source("statechange"),
        )
    };
    let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid("port must be 1-65535"));

    let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        match tail {
            "" => (host, DEFAULT_PORT),
            _ => match tail.strip_prefix(':') {
                Some(p) => (host, parse_port(p)?),
                None => return Err(invalid("unexpected characters after IPv6 literal")),
            },
        }
    } else {
        match raw.rsplit_once(':') {
            // A bare IPv6 address has more than one colon and no port.
            Some((h, p)) if !h.contains(':') => (h, parse_port(p)?),
            _ => (raw, DEFAULT_PORT),
        }
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    if port == 0 {
        return Err(invalid("port must be 1-65535"));
    }
    Ok((host.to_string(), port))
}

impl StateChangeConfig {
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let md: StateChangeMetadata = decode_metadata(properties)?;
        Self::from_metadata(md)
    }

    pub fn from_metadata(md: StateChangeMetadata) -> Result<Self> {
        let address = required(&md.address, "address")?;
        let (host, port) = split_address(&address)?;

        let connect_timeout = match md.connect_timeout.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_CONNECT_TIMEOUT,
            Some(raw) => parse_duration(raw).map_err(|e| {
                Error::configuration_with_context(
                    e.to_string(),
                    ErrorContext::new()
                        .with_field_path("connectTimeout")
                        .with_source("statechange"),
                )
            })?,
        };
        if connect_timeout.is_zero() {
            return Err(Error::configuration_with_context(
                "connectTimeout must be positive",
                ErrorContext::new()
                    .with_field_path("connectTimeout")
                    .with_source("statechange"),
            ));
        }

        Ok(Self {
            host,
            port,
            database: required(&md.database, "database")?,
            username: required(&md.username, "username")?,
            password: md.password,
            table: required(&md.table, "table")?,
            connect_timeout,
            num_retries: md.num_retries.unwrap_or(0),
        })
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Exponential backoff before connection attempt `attempt + 1`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = RETRY_MIN_DELAY.as_millis() as u64;
        let cap = RETRY_MAX_DELAY.as_millis() as u64;
        let delay = base.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(delay.min(cap))
    }

    /// Metadata attached to every delivered event.
    pub fn event_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("store-address".to_string(), self.address()),
            ("store-database".to_string(), self.database.clone()),
            ("store-table".to_string(), self.table.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn valid() -> Properties {
        props(&[
            ("address", "127.0.0.1:28015"),
            ("database", "app"),
            ("username", "admin"),
            ("password", "secret"),
            ("table", "orders"),
        ])
    }

    #[test]
    fn test_valid_config() {
        let cfg = StateChangeConfig::from_properties(&valid()).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 28015);
        assert_eq!(cfg.table, "orders");
        assert_eq!(cfg.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(cfg.num_retries, 0);
        assert!(!format!("{:?}", cfg).contains("secret"));
    }

    #[test]
    fn test_optional_fields() {
        let mut p = valid();
        p.insert("connectTimeout".into(), "1500ms".into());
        p.insert("numRetries".into(), "2".into());
        p.insert("password".into(), "".into());
        let cfg = StateChangeConfig::from_properties(&p).unwrap();
        assert_eq!(cfg.connect_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.num_retries, 2);
        assert!(cfg.password.is_empty());
    }

    #[test]
    fn test_required_fields() {
        for field in ["address", "database", "username", "table"] {
            let mut p = valid();
            p.insert(field.to_string(), "  ".into());
            let err = StateChangeConfig::from_properties(&p).unwrap_err();
            assert!(err.is_configuration());
            assert_eq!(err.context().unwrap().field_path.as_deref(), Some(field));

            let mut p = valid();
            p.remove(field);
            assert!(StateChangeConfig::from_properties(&p)
                .unwrap_err()
                .is_configuration());
        }
    }

    #[test]
    fn test_address_forms() {
        assert_eq!(split_address("db.local").unwrap(), ("db.local".into(), 28015));
        assert_eq!(split_address("db.local:1").unwrap(), ("db.local".into(), 1));
        assert_eq!(split_address("[::1]:9000").unwrap(), ("::1".into(), 9000));
        assert_eq!(split_address("[::1]").unwrap(), ("::1".into(), 28015));
        assert_eq!(split_address("fe80::1").unwrap(), ("fe80::1".into(), 28015));
        assert!(split_address(":28015").is_err());
        assert!(split_address("host:http").is_err());
        assert!(split_address("host:0").is_err());
        assert!(split_address("[::1").is_err());
    }

    #[test]
    fn test_bad_timeout() {
        let mut p = valid();
        p.insert("connectTimeout".into(), "soon".into());
        let err = StateChangeConfig::from_properties(&p).unwrap_err();
        assert_eq!(
            err.context().unwrap().field_path.as_deref(),
            Some("connectTimeout")
        );

        let mut p = valid();
        p.insert("connectTimeout".into(), "0s".into());
        assert!(StateChangeConfig::from_properties(&p).is_err());
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let cfg = StateChangeConfig::from_properties(&valid()).unwrap();
        assert_eq!(cfg.retry_delay(0), Duration::from_millis(250));
        assert_eq!(cfg.retry_delay(2), Duration::from_secs(1));
        assert_eq!(cfg.retry_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn test_event_metadata() {
        let cfg = StateChangeConfig::from_properties(&valid()).unwrap();
        let md = cfg.event_metadata();
        assert_eq!(md["store-address"], "127.0.0.1:28015");
        assert_eq!(md["store-database"], "app");
        assert_eq!(md["store-table"], "orders");
    }
}
