//! Logging for the easy-enclave binaries.
//!
//! Both binaries log through `tracing`. The default filter keeps our own
//! crates at INFO while quieting the transport stack underneath them, which
//! otherwise floods the agent's serial console with per-connection chatter.
//! Knobs:
//!
//! + `RUST_LOG` replaces the default filter wholesale.
//! + `EE_LOG_FORMAT=json` emits JSON lines instead of the compact human
//!   format, for shipping VM consoles into a collector.
//! + `EE_LOG_ANSI=0` drops the color codes that garble serial captures.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Dependencies whose INFO/DEBUG output is per-connection noise: the HTTP
/// and TLS stack under the control plane, and the tunnel's WebSocket layer.
const QUIET_TARGETS: &[&str] = &[
    "h2",
    "hyper",
    "reqwest",
    "rustls",
    "tokio_tungstenite",
    "tower_http",
    "tungstenite",
];

/// Install the global logger. Panics if one is already installed.
pub fn init() {
    try_init().expect("Failed to set up logger");
}

/// Install the global logger; `Err` if one is already installed.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|spec| Targets::from_str(&spec).ok())
        .unwrap_or_else(default_filter);
    let ansi = ee_common::env::bool_or("EE_LOG_ANSI", true);
    let json = ee_common::env::var("EE_LOG_FORMAT").as_deref() == Some("json");

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_ansi(ansi);

    if json {
        tracing_subscriber::registry()
            .with(fmt_layer.json().with_filter(filter))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt_layer.compact().with_filter(filter))
            .try_init()
    }
}

/// INFO for everything of ours, WARN for the noisy transport targets.
fn default_filter() -> Targets {
    let mut targets = Targets::new().with_default(Level::INFO);
    for target in QUIET_TARGETS {
        targets = targets.with_target(*target, Level::WARN);
    }
    targets
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_filter_quiets_transport_noise() {
        let filter = default_filter();
        assert!(filter.would_enable("ee_control::session", &Level::INFO));
        assert!(filter.would_enable("ee_agent::tunnel", &Level::INFO));
        assert!(!filter.would_enable("hyper::proto", &Level::INFO));
        assert!(!filter.would_enable("tungstenite::protocol", &Level::INFO));
        assert!(filter.would_enable("hyper::proto", &Level::WARN));
    }
}
