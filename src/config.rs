use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read once from `RESERVD_*` environment variables.
/// Missing or unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tx_max_attempts: u32,
    pub sweep_interval: Duration,
    pub stale_pending: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5480,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tx_max_attempts: 16,
            sweep_interval: Duration::from_secs(30),
            stale_pending: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let d = Self::default();
        Self {
            port: parsed(&lookup, "RESERVD_PORT").unwrap_or(d.port),
            bind: lookup("RESERVD_BIND").unwrap_or(d.bind),
            data_dir: lookup("RESERVD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: parsed(&lookup, "RESERVD_MAX_CONNECTIONS")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "RESERVD_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: parsed(&lookup, "RESERVD_METRICS_PORT"),
            tx_max_attempts: parsed(&lookup, "RESERVD_TX_MAX_ATTEMPTS")
                .filter(|&n: &u32| n > 0)
                .unwrap_or(d.tx_max_attempts),
            sweep_interval: parsed(&lookup, "RESERVD_SWEEP_INTERVAL_SECS")
                .filter(|&n: &u64| n > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.sweep_interval),
            stale_pending: parsed(&lookup, "RESERVD_STALE_PENDING_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.stale_pending),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservd.wal")
    }
}
