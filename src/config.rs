//! # Context Configuration
//!
//! This module is the analogue of the teacher's `cli.rs`: there, CLI flags
//! were parsed into a typed `BenchmarkConfig`. Here there is no CLI (out of
//! scope per spec.md §1); instead `Config` is a typed property bag built
//! from the `EPICS_CA_*` environment variables (spec.md §6) or from a
//! builder for programmatic construction, and it is what `Context::new`
//! consumes.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Status;
use crate::monitor::NotifierSpec;

/// Default CA UDP/TCP port.
pub const DEFAULT_SERVER_PORT: u16 = 5064;
/// Default CA repeater UDP port.
pub const DEFAULT_REPEATER_PORT: u16 = 5065;
/// Default receive payload cap (spec.md §4.1, §6).
pub const DEFAULT_MAX_ARRAY_BYTES: usize = 16 * 1024;
/// Default beacon/keep-alive period.
pub const DEFAULT_BEACON_PERIOD: Duration = Duration::from_secs(15);
/// Default connection timeout applied only when the caller requests one.
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(30);

/// Context-wide configuration, built from `EPICS_CA_*` environment
/// variables or programmatically.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit search target addresses (`EPICS_CA_ADDR_LIST`). Empty means
    /// "use subnet broadcast" when `auto_addr_list` is true.
    pub addr_list: Vec<SocketAddr>,
    /// Whether to add local subnet broadcast addresses automatically
    /// (`EPICS_CA_AUTO_ADDR_LIST`).
    pub auto_addr_list: bool,
    /// Connection timeout applied by callers of `connect()`
    /// (`EPICS_CA_CONN_TMO`).
    pub conn_timeout: Duration,
    /// Beacon/keep-alive period (`EPICS_CA_BEACON_PERIOD`).
    pub beacon_period: Duration,
    /// Peer CA TCP/UDP port (`EPICS_CA_SERVER_PORT`).
    pub server_port: u16,
    /// Repeater UDP port (`EPICS_CA_REPEATER_PORT`).
    pub repeater_port: u16,
    /// Receive payload cap in bytes (`EPICS_CA_MAX_ARRAY_BYTES`).
    pub max_array_bytes: usize,
    /// Monitor notifier strategy spec string (`CA_MONITOR_NOTIFIER_IMPL`).
    pub notifier: NotifierSpec,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr_list: Vec::new(),
            auto_addr_list: true,
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            beacon_period: DEFAULT_BEACON_PERIOD,
            server_port: DEFAULT_SERVER_PORT,
            repeater_port: DEFAULT_REPEATER_PORT,
            max_array_bytes: DEFAULT_MAX_ARRAY_BYTES,
            notifier: NotifierSpec::default(),
        }
    }
}

impl Config {
    /// Build a `Config` from the process environment, applying spec.md §6's
    /// defaults for any key that is absent or unparseable is reported as a
    /// `Status::ConfigError` — construction fails rather than silently
    /// falling back, per spec.md §7 ("Configuration error ... Context
    /// construction fails; nothing is started").
    pub fn from_env() -> Result<Self, Status> {
        let mut cfg = Config::default();

        if let Ok(raw) = std::env::var("EPICS_CA_ADDR_LIST") {
            cfg.addr_list = parse_addr_list(&raw, cfg.server_port)?;
        }
        if let Ok(raw) = std::env::var("EPICS_CA_AUTO_ADDR_LIST") {
            cfg.auto_addr_list = parse_bool(&raw)?;
        }
        if let Ok(raw) = std::env::var("EPICS_CA_CONN_TMO") {
            cfg.conn_timeout = Duration::from_secs_f64(parse_f64(&raw, "EPICS_CA_CONN_TMO")?);
        }
        if let Ok(raw) = std::env::var("EPICS_CA_BEACON_PERIOD") {
            cfg.beacon_period =
                Duration::from_secs_f64(parse_f64(&raw, "EPICS_CA_BEACON_PERIOD")?);
        }
        if let Ok(raw) = std::env::var("EPICS_CA_SERVER_PORT") {
            cfg.server_port = parse_u16(&raw, "EPICS_CA_SERVER_PORT")?;
        }
        if let Ok(raw) = std::env::var("EPICS_CA_REPEATER_PORT") {
            cfg.repeater_port = parse_u16(&raw, "EPICS_CA_REPEATER_PORT")?;
        }
        if let Ok(raw) = std::env::var("EPICS_CA_MAX_ARRAY_BYTES") {
            cfg.max_array_bytes = raw.parse().map_err(|_| {
                Status::ConfigError(format!("EPICS_CA_MAX_ARRAY_BYTES: not a number: {raw}"))
            })?;
        }
        if let Ok(raw) = std::env::var("CA_MONITOR_NOTIFIER_IMPL") {
            cfg.notifier = NotifierSpec::parse(&raw)?;
        }

        Ok(cfg)
    }

    /// Start building a `Config` programmatically, starting from defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Config::default())
    }
}

/// Builder for programmatic `Config` construction (used heavily by tests,
/// which don't want to mutate process environment variables).
#[derive(Debug, Clone)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn addr_list(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.0.addr_list = addrs;
        self
    }

    pub fn auto_addr_list(mut self, v: bool) -> Self {
        self.0.auto_addr_list = v;
        self
    }

    pub fn conn_timeout(mut self, d: Duration) -> Self {
        self.0.conn_timeout = d;
        self
    }

    pub fn beacon_period(mut self, d: Duration) -> Self {
        self.0.beacon_period = d;
        self
    }

    pub fn server_port(mut self, port: u16) -> Self {
        self.0.server_port = port;
        self
    }

    pub fn max_array_bytes(mut self, n: usize) -> Self {
        self.0.max_array_bytes = n;
        self
    }

    pub fn notifier(mut self, spec: NotifierSpec) -> Self {
        self.0.notifier = spec;
        self
    }

    pub fn build(self) -> Config {
        self.0
    }
}

fn parse_bool(raw: &str) -> Result<bool, Status> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Status::ConfigError(format!(
            "EPICS_CA_AUTO_ADDR_LIST: not a boolean: {raw}"
        ))),
    }
}

fn parse_f64(raw: &str, key: &str) -> Result<f64, Status> {
    raw.trim()
        .parse()
        .map_err(|_| Status::ConfigError(format!("{key}: not a number: {raw}")))
}

fn parse_u16(raw: &str, key: &str) -> Result<u16, Status> {
    raw.trim()
        .parse()
        .map_err(|_| Status::ConfigError(format!("{key}: not a port number: {raw}")))
}

fn parse_addr_list(raw: &str, default_port: u16) -> Result<Vec<SocketAddr>, Status> {
    raw.split_whitespace()
        .map(|tok| {
            if tok.contains(':') {
                tok.parse::<SocketAddr>()
                    .map_err(|_| Status::ConfigError(format!("EPICS_CA_ADDR_LIST: bad address: {tok}")))
            } else {
                let ip: std::net::IpAddr = tok
                    .parse()
                    .map_err(|_| Status::ConfigError(format!("EPICS_CA_ADDR_LIST: bad address: {tok}")))?;
                Ok(SocketAddr::new(ip, default_port))
            }
        })
        .collect()
}
