use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Where the collect server binds: a TCP host:port or a Unix socket path.
#[derive(Debug, Clone)]
pub enum BindAddress {
    Tcp(String),
    Unix(PathBuf),
}

impl BindAddress {
    fn parse(raw: &str) -> Result<Self> {
        if let Some(path) = raw.strip_prefix("unix:") {
            return Ok(BindAddress::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = raw.strip_prefix("tcp:") {
            return Ok(BindAddress::Tcp(addr.to_string()));
        }
        // bare host:port defaults to tcp, matching a plain address string.
        Ok(BindAddress::Tcp(raw.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub data_dir: PathBuf,
    pub bind_address: BindAddress,
    pub sink_conf: Option<PathBuf>,
    pub wal_rotate_bytes: u64,
    pub consolidation_chunk_bytes: u64,
    pub fd_cache_timeout: Duration,
    pub sink_reload_interval: Duration,
    pub queue_capacity: usize,
    pub queue_wait_timeout: Duration,
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env_string(
            "SKVOZ_DATA_DIR",
            Some("/var/lib/skvoz/data".to_string()),
        )?);
        let bind_address = BindAddress::parse(&env_string(
            "SKVOZ_COLLECT_BIND",
            Some("tcp:0.0.0.0:9190".to_string()),
        )?)?;
        let sink_conf = env_optional("SKVOZ_SINK_CONF").map(PathBuf::from);

        let wal_rotate_bytes =
            env_u64("SKVOZ_WAL_ROTATE_BYTES", Some(16 * 1024 * 1024))?;
        let consolidation_chunk_bytes =
            env_u64("SKVOZ_CONSOLIDATION_CHUNK_BYTES", Some(24 * 1024 * 1024))?;
        let fd_cache_timeout =
            Duration::from_secs(env_u64("SKVOZ_FD_CACHE_TIMEOUT_SECONDS", Some(1))?);
        let sink_reload_interval =
            Duration::from_secs(env_u64("SKVOZ_SINK_RELOAD_SECONDS", Some(30))?);
        let queue_capacity = env_u64("SKVOZ_QUEUE_CAPACITY", Some(10_000))? as usize;
        let queue_wait_timeout =
            Duration::from_secs(env_u64("SKVOZ_QUEUE_WAIT_TIMEOUT_SECONDS", Some(1))?);

        Ok(Self {
            data_dir,
            bind_address,
            sink_conf,
            wal_rotate_bytes,
            consolidation_chunk_bytes,
            fd_cache_timeout,
            sink_reload_interval,
            queue_capacity,
            queue_wait_timeout,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub data_dir: PathBuf,
    pub http_bind: String,
}

impl AggregatorConfig {
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env_string(
            "SKVOZ_DATA_DIR",
            Some("/var/lib/skvoz/data".to_string()),
        )?);
        let http_bind =
            env_string("SKVOZ_AGGREGATOR_HTTP_BIND", Some("127.0.0.1:9191".to_string()))?;

        Ok(Self {
            data_dir,
            http_bind,
        })
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_parses_unix_and_tcp_prefixes() {
        assert!(matches!(BindAddress::parse("unix:/tmp/s").unwrap(), BindAddress::Unix(p) if p == PathBuf::from("/tmp/s")));
        assert!(matches!(BindAddress::parse("tcp:0.0.0.0:9190").unwrap(), BindAddress::Tcp(a) if a == "0.0.0.0:9190"));
    }

    #[test]
    fn bind_address_bare_host_port_defaults_to_tcp() {
        assert!(matches!(BindAddress::parse("localhost:9190").unwrap(), BindAddress::Tcp(a) if a == "localhost:9190"));
    }

    #[test]
    fn env_string_falls_back_to_default_when_unset() {
        let key = "SKVOZ_TEST_ENV_STRING_UNSET";
        env::remove_var(key);
        assert_eq!(env_string(key, Some("fallback".to_string())).unwrap(), "fallback");
    }

    #[test]
    fn env_string_errors_without_default() {
        let key = "SKVOZ_TEST_ENV_STRING_MISSING";
        env::remove_var(key);
        assert!(env_string(key, None).is_err());
    }

    #[test]
    fn env_u64_rejects_non_numeric_override() {
        let key = "SKVOZ_TEST_ENV_U64_BAD";
        env::set_var(key, "not-a-number");
        let result = env_u64(key, Some(1));
        env::remove_var(key);
        assert!(result.is_err());
    }

    #[test]
    fn env_optional_treats_blank_as_absent() {
        let key = "SKVOZ_TEST_ENV_OPTIONAL_BLANK";
        env::set_var(key, "   ");
        let result = env_optional(key);
        env::remove_var(key);
        assert_eq!(result, None);
    }
}
