//! Process-wide tunables.
//!
//! No config *file* is parsed here — loading TOML/YAML and watching it for
//! changes is left to an external config loader. Each tunable is a default
//! with an environment-variable override, read once at startup.

use std::env;
use std::time::Duration;

/// Default bound on `history` length, in bytes. ~1 MiB.
const DEFAULT_HISTORY_LIMIT: usize = 1024 * 1024;

/// Default cap on `Session::executions`.
const DEFAULT_EXECUTION_CAP: usize = 100;

/// Default interval between Foreground Prober ticks.
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Default ceiling on `resize` cols/rows.
const DEFAULT_MAX_GEOMETRY: u16 = 500;

/// Default starting geometry for newly created sessions.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Port range the REST/WS server scans for a free bind address.
const DEFAULT_PORT_RANGE: (u16, u16) = (7900, 7999);

#[derive(Debug, Clone)]
pub struct Config {
    pub history_limit: usize,
    pub execution_cap: usize,
    pub probe_interval: Duration,
    pub max_geometry: u16,
    pub default_cols: u16,
    pub default_rows: u16,
    pub port_range: (u16, u16),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            execution_cap: DEFAULT_EXECUTION_CAP,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            max_geometry: DEFAULT_MAX_GEOMETRY,
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
            port_range: DEFAULT_PORT_RANGE,
        }
    }
}

impl Config {
    /// Builds a `Config` from defaults, overridden by `TABMINAL_*` env vars
    /// when present and parseable. Unparseable values are logged and ignored
    /// rather than treated as fatal — this is a tunable, not a required input.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_usize("TABMINAL_HISTORY_LIMIT") {
            cfg.history_limit = v;
        }
        if let Some(v) = env_usize("TABMINAL_EXECUTION_CAP") {
            cfg.execution_cap = v;
        }
        if let Some(v) = env_usize("TABMINAL_PROBE_INTERVAL_MS") {
            cfg.probe_interval = Duration::from_millis(v as u64);
        }
        if let Some(v) = env_u16("TABMINAL_MAX_GEOMETRY") {
            cfg.max_geometry = v;
        }

        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("ignoring malformed {key}={raw:?}, using default");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_u16(key: &str) -> Option<u16> {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("ignoring malformed {key}={raw:?}, using default");
                None
            }
        },
        Err(_) => None,
    }
}
