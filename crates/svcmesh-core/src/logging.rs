//! Opt-in tracing subscriber setup
//!
//! Library code only emits `tracing` events; binaries and tests call
//! [`init`] to install a formatting subscriber. The minimum level comes from
//! the configured membership log level unless `RUST_LOG` overrides it.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global fmt subscriber filtered at `min_level`.
///
/// `min_level` uses the membership level names (DEBUG, INFO, WARN, ERR).
/// With `disable` set, or when a global subscriber is already installed,
/// this is a no-op.
pub fn init(min_level: &str, disable: bool) {
    if disable {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive(min_level)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn directive(min_level: &str) -> &'static str {
    match min_level.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERR" | "ERROR" => "error",
        _ => "info",
    }
}
