use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

/// Server settings, read once at startup from `HALLKEEP_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login name that acts as a built-in administrator in every hall.
    pub superuser: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor runs.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: try_load(&var, "HALLKEEP_PORT", 5433),
            bind: var("HALLKEEP_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: var("HALLKEEP_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: var("HALLKEEP_PASSWORD").unwrap_or_else(|| "hallkeep".into()),
            superuser: var("HALLKEEP_SUPERUSER").unwrap_or_else(|| "admin".into()),
            max_connections: try_load(&var, "HALLKEEP_MAX_CONNECTIONS", 256),
            compact_threshold: try_load(&var, "HALLKEEP_COMPACT_THRESHOLD", 1000),
            tls_cert: var("HALLKEEP_TLS_CERT"),
            tls_key: var("HALLKEEP_TLS_KEY"),
            metrics_port: var("HALLKEEP_METRICS_PORT").and_then(|s| match s.parse() {
                Ok(port) => Some(port),
                Err(e) => {
                    warn!("invalid HALLKEEP_METRICS_PORT {s:?}: {e}, metrics disabled");
                    None
                }
            }),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn try_load<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match var(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("invalid {key} value {raw:?}: {e}, using default {default}");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_with(&[]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.password, "hallkeep");
        assert_eq!(config.superuser, "admin");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert!(config.tls_cert.is_none());
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = config_with(&[
            ("HALLKEEP_PORT", "6000"),
            ("HALLKEEP_SUPERUSER", "warden"),
            ("HALLKEEP_COMPACT_THRESHOLD", "50"),
            ("HALLKEEP_METRICS_PORT", "9100"),
        ]);
        assert_eq!(config.port, 6000);
        assert_eq!(config.superuser, "warden");
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let config = config_with(&[
            ("HALLKEEP_PORT", "not-a-port"),
            ("HALLKEEP_MAX_CONNECTIONS", "-3"),
            ("HALLKEEP_METRICS_PORT", "99999"),
        ]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
    }
}
