use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::args;
use crate::logs::DEFAULT_LOG_MAX_LINES;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_BINARY: &str = "tnet";

/// Control-plane settings, read once at boot from `TNET_*` environment variables.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen: SocketAddr,
    /// Program (plus optional leading arguments) that runs `<kind> <args...>`.
    pub binary: Vec<String>,
    /// When set, instances are persisted to `<data_root>/instances.json`.
    pub data_root: Option<PathBuf>,
    /// When set, mutating routes require `Authorization: Bearer <token>`.
    pub admin_token: Option<String>,
    /// Empty means Origin is not checked.
    pub allowed_origins: Vec<String>,
    pub launch_timeout: Duration,
    pub terminate_timeout: Duration,
    pub early_exit: Duration,
    pub term_grace: Duration,
    pub status_poll_interval: Duration,
    pub log_max_lines: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8080).into(),
            binary: vec![DEFAULT_BINARY.to_string()],
            data_root: None,
            admin_token: None,
            allowed_origins: Vec::new(),
            launch_timeout: Duration::from_secs(10),
            terminate_timeout: Duration::from_secs(10),
            early_exit: Duration::from_millis(300),
            term_grace: Duration::from_secs(3),
            status_poll_interval: Duration::from_secs(10),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
        }
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Duration {
    lookup(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|v| Duration::from_millis(v.clamp(min_ms, max_ms)))
        .unwrap_or(default)
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ControlConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen = match non_empty(lookup("TNET_LISTEN")) {
            Some(raw) => raw
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid TNET_LISTEN: {raw}"))?,
            None => DEFAULT_LISTEN.parse()?,
        };

        let binary = match non_empty(lookup("TNET_BINARY")) {
            Some(raw) => {
                let parts = args::tokenize(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid TNET_BINARY: {e}"))?;
                if parts.is_empty() {
                    defaults.binary.clone()
                } else {
                    parts
                }
            }
            None => defaults.binary.clone(),
        };

        let allowed_origins = lookup("TNET_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        let log_max_lines = lookup("TNET_LOG_MAX_LINES")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map(|v| v.clamp(100, 50_000))
            .unwrap_or(defaults.log_max_lines);

        let launch_timeout = millis(
            &lookup,
            "TNET_LAUNCH_TIMEOUT_MS",
            defaults.launch_timeout,
            100,
            10 * 60 * 1000,
        );
        let early_exit = millis(&lookup, "TNET_EARLY_EXIT_MS", defaults.early_exit, 0, 60_000);
        // Every launch would otherwise time out before its early-exit check ends.
        if !early_exit.is_zero() && early_exit >= launch_timeout {
            anyhow::bail!(
                "TNET_EARLY_EXIT_MS ({}ms) must be shorter than TNET_LAUNCH_TIMEOUT_MS ({}ms)",
                early_exit.as_millis(),
                launch_timeout.as_millis()
            );
        }

        Ok(Self {
            listen,
            binary,
            data_root: non_empty(lookup("TNET_DATA_ROOT")).map(PathBuf::from),
            admin_token: non_empty(lookup("TNET_ADMIN_TOKEN")),
            allowed_origins,
            launch_timeout,
            terminate_timeout: millis(
                &lookup,
                "TNET_TERMINATE_TIMEOUT_MS",
                defaults.terminate_timeout,
                100,
                10 * 60 * 1000,
            ),
            early_exit,
            term_grace: millis(&lookup, "TNET_TERM_GRACE_MS", defaults.term_grace, 100, 60_000),
            status_poll_interval: millis(
                &lookup,
                "TNET_STATUS_POLL_INTERVAL_MS",
                defaults.status_poll_interval,
                1000,
                10 * 60 * 1000,
            ),
            log_max_lines,
        })
    }

    pub fn instances_path(&self) -> Option<PathBuf> {
        self.data_root.as_ref().map(|root| root.join("instances.json"))
    }
}
