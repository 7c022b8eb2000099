use std::path::PathBuf;

use crate::engine::DEFAULT_GRACE_WINDOW_MS;
use crate::model::Ms;

/// Server settings, read from `FLEXDESK_*` environment variables. Unset or
/// unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub grace_window_ms: Ms,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "flexdesk".into(),
            max_connections: 256,
            compact_threshold: 1000,
            grace_window_ms: DEFAULT_GRACE_WINDOW_MS,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| get(key).and_then(|v| v.trim().parse().ok());
        Self {
            port: parsed("FLEXDESK_PORT").unwrap_or(defaults.port),
            bind: get("FLEXDESK_BIND").unwrap_or(defaults.bind),
            data_dir: get("FLEXDESK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: get("FLEXDESK_PASSWORD").unwrap_or(defaults.password),
            max_connections: get("FLEXDESK_MAX_CONNECTIONS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: get("FLEXDESK_COMPACT_THRESHOLD")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.compact_threshold),
            grace_window_ms: get("FLEXDESK_GRACE_WINDOW_MS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|ms: &Ms| *ms >= 0)
                .unwrap_or(defaults.grace_window_ms),
            tls_cert: get("FLEXDESK_TLS_CERT"),
            tls_key: get("FLEXDESK_TLS_KEY"),
            metrics_port: parsed("FLEXDESK_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.grace_window_ms, 259_200_000);
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("FLEXDESK_PORT", "6000"),
            ("FLEXDESK_BIND", "127.0.0.1"),
            ("FLEXDESK_DATA_DIR", "/var/lib/flexdesk"),
            ("FLEXDESK_PASSWORD", "s3cret"),
            ("FLEXDESK_MAX_CONNECTIONS", "32"),
            ("FLEXDESK_COMPACT_THRESHOLD", "50"),
            ("FLEXDESK_GRACE_WINDOW_MS", "3600000"),
            ("FLEXDESK_TLS_CERT", "cert.pem"),
            ("FLEXDESK_TLS_KEY", "key.pem"),
            ("FLEXDESK_METRICS_PORT", "9100"),
        ]));
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/flexdesk"));
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.grace_window_ms, 3_600_000);
        assert_eq!(config.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(config.tls_key.as_deref(), Some("key.pem"));
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("FLEXDESK_PORT", "not-a-port"),
            ("FLEXDESK_MAX_CONNECTIONS", "0"),
            ("FLEXDESK_GRACE_WINDOW_MS", "-5"),
            ("FLEXDESK_METRICS_PORT", "99999"),
        ]));
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.grace_window_ms, DEFAULT_GRACE_WINDOW_MS);
        assert_eq!(config.metrics_port, None);
    }
}
