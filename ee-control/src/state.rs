//! Process-wide state shared by the HTTP surface and the sessions.

use std::sync::Arc;

use anyhow::Context;
use ee_ledger::LedgerStore;

use crate::{
    allowlist::{AllowlistStore, DEFAULT_TTL},
    config::Config,
    registry::{Registry, RegistryConfig},
    tunnels::Tunnels,
};

pub struct ControlPlane {
    pub config: Config,
    pub registry: Registry,
    pub allowlists: AllowlistStore,
    pub ledger: LedgerStore,
    pub tunnels: Tunnels,
    pub http: reqwest::Client,
}

pub type SharedState = Arc<ControlPlane>;

impl ControlPlane {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let registry = Registry::new(RegistryConfig {
            ttl_days: config.registration_ttl_days,
            warn_days: config.registration_warn_days,
            sealed_networks: config.sealed_networks.clone(),
        });
        let allowlists = AllowlistStore::new(
            http.clone(),
            config.allowlist_asset.clone(),
            config.github_token.clone(),
            DEFAULT_TTL,
        );
        let ledger = LedgerStore::open(&config.db_path)
            .with_context(|| format!("Failed to open ledger at {}", config.db_path.display()))?;

        Ok(Self {
            config,
            registry,
            allowlists,
            ledger,
            tunnels: Tunnels::default(),
            http,
        })
    }

    /// In-memory variant for tests.
    #[cfg(test)]
    pub fn for_testing(config: Config) -> Self {
        Self {
            registry: Registry::new(RegistryConfig {
                ttl_days: config.registration_ttl_days,
                warn_days: config.registration_warn_days,
                sealed_networks: config.sealed_networks.clone(),
            }),
            allowlists: AllowlistStore::new(
                reqwest::Client::new(),
                config.allowlist_asset.clone(),
                None,
                DEFAULT_TTL,
            ),
            ledger: LedgerStore::open_in_memory().expect("in-memory ledger"),
            tunnels: Tunnels::default(),
            http: reqwest::Client::new(),
            config,
        }
    }
}
