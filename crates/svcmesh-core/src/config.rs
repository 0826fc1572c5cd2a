//! Environment-driven configuration for the membership engine
//!
//! Every key carries the `SVCMESH_` namespace prefix. Durations accept either
//! a bare integer, interpreted in the key's implicit unit, or a humantime
//! string such as `200ms` or `1m30s`. A value that parses as neither falls
//! back to the key's default and is reported at debug level.

use crate::error::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Namespace prefix applied to every environment key.
pub const ENV_PREFIX: &str = "SVCMESH_";

/// Default membership port when none is configured or a seed omits one.
pub const DEFAULT_MEM_PORT: u16 = 7946;

/// Default HTTP port advertised in the local node meta.
pub const DEFAULT_HTTP_PORT: u16 = 6060;

/// Implicit unit applied when a duration key holds a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImplicitUnit {
    Seconds,
    Millis,
}

impl ImplicitUnit {
    fn apply(self, n: u64) -> Duration {
        match self {
            ImplicitUnit::Seconds => Duration::from_secs(n),
            ImplicitUnit::Millis => Duration::from_millis(n),
        }
    }
}

/// Every tunable of the membership engine and registry facade.
#[derive(Debug, Clone)]
pub struct MemberConfig {
    /// Logical service name advertised in the node meta. Required.
    pub service_name: String,
    /// Stable member name, unique within the cluster. Defaults to the OS
    /// hostname.
    pub node_name: String,
    /// UDP/TCP port the membership engine binds and advertises.
    pub bind_port: u16,
    /// Advertise host. Empty means bind-all; a leading dot is expanded by
    /// prepending the OS hostname.
    pub advertise_host: String,
    /// Seed endpoints contacted on join, already normalized to `host:port`.
    pub seeds: Vec<String>,
    /// Number of relay members asked to probe an unresponsive peer.
    pub indirect_checks: usize,
    /// Number of members gossiped to per gossip tick.
    pub gossip_nodes: usize,
    /// Interval between gossip ticks.
    pub gossip_interval: Duration,
    /// Interval between failure-detector probe ticks.
    pub probe_interval: Duration,
    /// Deadline for a direct probe ack.
    pub probe_timeout: Duration,
    /// Multiplier for the suspicion timeout.
    pub suspicion_mult: u32,
    /// Interval between anti-entropy push/pull exchanges.
    pub push_pull_interval: Duration,
    /// How long dead members keep receiving gossip so the information
    /// propagates.
    pub gossip_to_the_dead_time: Duration,
    /// How long after death a member becomes eligible for reclamation.
    /// Zero means never. Kept independent from
    /// [`gossip_to_the_dead_time`](Self::gossip_to_the_dead_time); operators
    /// set both.
    pub dead_node_reclaim_time: Duration,
    /// Bound on every TCP socket operation.
    pub tcp_timeout: Duration,
    /// Broadcast retransmit multiplier; each queued item is sent at most
    /// `retransmit_mult * ceil(log10(n + 1))` times.
    pub retransmit_mult: usize,
    /// Pinned node weight. Zero selects load-driven recomputation.
    pub weight: i32,
    /// Interval between weight recomputations. Forced to zero when a weight
    /// is pinned.
    pub weight_interval: Duration,
    /// HTTP port advertised in the node meta.
    pub http_port: u16,
    /// HTTP route root path advertised in the node meta.
    pub route_root_path: String,
    /// Suppress membership log output entirely.
    pub log_disable: bool,
    /// Minimum log level: DEBUG, INFO, WARN or ERR.
    pub log_level: String,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            node_name: os_hostname(),
            bind_port: DEFAULT_MEM_PORT,
            advertise_host: String::new(),
            seeds: Vec::new(),
            indirect_checks: 3,
            gossip_nodes: 3,
            gossip_interval: Duration::from_millis(200),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            suspicion_mult: 4,
            push_pull_interval: Duration::from_secs(30),
            gossip_to_the_dead_time: Duration::from_secs(30),
            dead_node_reclaim_time: Duration::ZERO,
            tcp_timeout: Duration::from_secs(10),
            retransmit_mult: 4,
            weight: 0,
            weight_interval: Duration::from_secs(5),
            http_port: DEFAULT_HTTP_PORT,
            route_root_path: String::new(),
            log_disable: false,
            log_level: "INFO".to_string(),
        }
    }
}

impl MemberConfig {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Load the configuration through an arbitrary key lookup.
    ///
    /// The lookup receives keys without the namespace prefix. Used directly
    /// by tests to avoid touching process-global environment state.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let service_name = lookup("SERVICE_NAME").unwrap_or_default();
        if service_name.trim().is_empty() {
            return Err(Error::config(format!(
                "no env variable {ENV_PREFIX}SERVICE_NAME found"
            )));
        }

        let bind_port = int_value(&lookup, "MEM_PORT", defaults.bind_port as u64) as u16;

        let mut advertise_host = lookup("MEM_HOST").unwrap_or_default();
        if advertise_host.starts_with('.') {
            advertise_host = format!("{}{}", os_hostname(), advertise_host);
        }

        let node_name = match lookup("MEM_NAME") {
            Some(name) if !name.trim().is_empty() => name,
            _ => defaults.node_name.clone(),
        };

        let seeds = parse_seeds(&lookup("MEM_SEED").unwrap_or_default(), bind_port);

        let weight = int_value(&lookup, "MEM_WEIGHT", 0) as i32;
        // A pinned weight disables recomputation entirely.
        let weight_interval = if weight > 0 {
            Duration::ZERO
        } else {
            duration_value(
                &lookup,
                "MEM_WEIGHT_INTERVAL",
                defaults.weight_interval,
                ImplicitUnit::Millis,
            )
        };

        let log_level = normalize_level(&lookup("LOG_LEVEL").unwrap_or_default(), &defaults.log_level);

        let config = Self {
            service_name,
            node_name,
            bind_port,
            advertise_host,
            seeds,
            indirect_checks: int_value(&lookup, "MEM_INDIRECT_CHECKS", defaults.indirect_checks as u64)
                as usize,
            gossip_nodes: int_value(&lookup, "MEM_GOSSIP_NODES", defaults.gossip_nodes as u64) as usize,
            gossip_interval: duration_value(
                &lookup,
                "MEM_GOSSIP_INTERVAL",
                defaults.gossip_interval,
                ImplicitUnit::Millis,
            ),
            probe_interval: duration_value(
                &lookup,
                "MEM_PROBE_INTERVAL",
                defaults.probe_interval,
                ImplicitUnit::Seconds,
            ),
            probe_timeout: duration_value(
                &lookup,
                "MEM_PROBE_TIMEOUT",
                defaults.probe_timeout,
                ImplicitUnit::Seconds,
            ),
            suspicion_mult: int_value(&lookup, "MEM_SUSPICION_MULT", defaults.suspicion_mult as u64)
                as u32,
            push_pull_interval: duration_value(
                &lookup,
                "MEM_SYNC_INTERVAL",
                defaults.push_pull_interval,
                ImplicitUnit::Seconds,
            ),
            gossip_to_the_dead_time: duration_value(
                &lookup,
                "MEM_DEAD_TIMEOUT",
                defaults.gossip_to_the_dead_time,
                ImplicitUnit::Seconds,
            ),
            dead_node_reclaim_time: duration_value(
                &lookup,
                "MEM_RECLAIM_TIMEOUT",
                defaults.dead_node_reclaim_time,
                ImplicitUnit::Seconds,
            ),
            tcp_timeout: duration_value(
                &lookup,
                "MEM_TCP_TIMEOUT",
                defaults.tcp_timeout,
                ImplicitUnit::Seconds,
            ),
            retransmit_mult: int_value(&lookup, "MEM_RETRANSMIT_MULT", defaults.retransmit_mult as u64)
                as usize,
            weight,
            weight_interval,
            http_port: int_value(&lookup, "PORT", defaults.http_port as u64) as u16,
            route_root_path: lookup("ROUTE_ROOT_PATH").unwrap_or_default(),
            log_disable: bool_value(&lookup, "MEM_LOG_DISABLE", defaults.log_disable),
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.probe_interval.is_zero() {
            return Err(Error::config("probe interval must be greater than zero"));
        }
        if self.probe_timeout.is_zero() {
            return Err(Error::config("probe timeout must be greater than zero"));
        }
        if self.probe_timeout >= self.probe_interval {
            return Err(Error::config(
                "probe timeout must be shorter than the probe interval",
            ));
        }
        if self.gossip_interval.is_zero() {
            return Err(Error::config("gossip interval must be greater than zero"));
        }
        if self.indirect_checks == 0 {
            return Err(Error::config("indirect checks must be greater than zero"));
        }
        if self.gossip_nodes == 0 {
            return Err(Error::config("gossip nodes must be greater than zero"));
        }
        if self.retransmit_mult == 0 {
            return Err(Error::config("retransmit mult must be greater than zero"));
        }
        Ok(())
    }
}

/// Parse a comma-separated seed list, normalizing every entry to `host:port`.
///
/// A missing or unparseable port is replaced by `default_port`.
pub fn parse_seeds(raw: &str, default_port: u16) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) => format!("{host}:{port}"),
                Err(_) => format!("{host}:{default_port}"),
            },
            _ => format!("{entry}:{default_port}"),
        })
        .collect()
}

/// The OS hostname, falling back to `localhost` when it cannot be read.
pub fn os_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn int_value<F>(lookup: &F, key: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                debug!(key, value = %raw, "unparseable integer, using default");
                default
            }
        },
        None => default,
    }
}

fn bool_value<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                debug!(key, value = %raw, "unparseable boolean, using default");
                default
            }
        },
        None => default,
    }
}

fn duration_value<F>(lookup: &F, key: &str, default: Duration, unit: ImplicitUnit) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let raw = match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return default,
    };
    let trimmed = raw.trim();
    if let Ok(n) = trimmed.parse::<u64>() {
        return unit.apply(n);
    }
    match humantime::parse_duration(trimmed) {
        Ok(duration) => duration,
        Err(_) => {
            debug!(key, value = %raw, "unparseable duration, using default");
            default
        }
    }
}

fn normalize_level(raw: &str, default: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    match upper.as_str() {
        "" => default.to_string(),
        "ERROR" => "ERR".to_string(),
        "WARNING" => "WARN".to_string(),
        _ => upper,
    }
}
