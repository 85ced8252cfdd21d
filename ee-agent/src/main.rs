//! The easy-enclave agent.
//!
//! Runs inside the trust domain: serves the attestation/deploy HTTP API
//! (optionally behind an RA-TLS terminator) and keeps a control-channel
//! tunnel open to the control plane.

mod attestation;
mod config;
mod deploy;
mod server;
mod tunnel;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use ee_attest::{
    provider::{ConfigfsTsm, FakeQuoteProvider, QuoteProvider},
    ratls::{RatlsStore, DEFAULT_COMMON_NAME},
    tls::server_config,
};
use ee_common::{
    shutdown::ShutdownSignal,
    task::{join_static_tasks, EeTask},
};
use tracing::{error, info};

use crate::{
    config::Config,
    deploy::DeploymentStore,
    server::AgentState,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(8);
const GRACE_PERIOD: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ee_logger::init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let config = Config::from_env();
    let bind_addr: SocketAddr = format!("{}:{}", config.bind, config.main_port)
        .parse()
        .context("Bad bind address")?;

    let provider: Box<dyn QuoteProvider> = if config.ratls_allow_fake_quote {
        Box::new(FakeQuoteProvider)
    } else {
        Box::new(ConfigfsTsm::new())
    };
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let state = Arc::new(AgentState {
        deployments: DeploymentStore::new(config.state_dir.clone()),
        provider,
        http,
        config,
    });

    let shutdown = ShutdownSignal::new();
    let mut tasks = Vec::new();

    // HTTP API, fronted by RA-TLS when enabled.
    let router = server::router(state.clone());
    let handle = axum_server::Handle::new();
    if state.config.ratls_enabled {
        let tls_provider: Box<dyn QuoteProvider> = if state.config.ratls_allow_fake_quote {
            Box::new(FakeQuoteProvider)
        } else {
            Box::new(ConfigfsTsm::new())
        };
        let ratls = RatlsStore::new(
            tls_provider,
            DEFAULT_COMMON_NAME,
            state.config.ratls_cert_ttl,
            Some(state.config.ratls_dir.clone()),
        );
        let material = ratls.ensure().context("Failed to produce RA-TLS material")?;
        let tls = server_config(&material, None).context("Bad RA-TLS server config")?;
        let rustls_config = RustlsConfig::from_config(Arc::new(tls));

        info!("agent api (ra-tls) on https://{bind_addr}");
        let server_handle = handle.clone();
        tasks.push(EeTask::spawn("agent-api", async move {
            let result = axum_server::bind_rustls(bind_addr, rustls_config)
                .handle(server_handle)
                .serve(router.into_make_service())
                .await;
            if let Err(e) = result {
                error!("agent api failed: {e}");
            }
        }));
    } else {
        info!("agent api on http://{bind_addr}");
        let server_handle = handle.clone();
        tasks.push(EeTask::spawn("agent-api", async move {
            let result = axum_server::bind(bind_addr)
                .handle(server_handle)
                .serve(router.into_make_service())
                .await;
            if let Err(e) = result {
                error!("agent api failed: {e}");
            }
        }));
    }

    // Tunnel client.
    tasks.push(EeTask::spawn(
        "tunnel-client",
        tunnel::run(state.clone(), shutdown.clone()),
    ));

    {
        let shutdown = shutdown.clone();
        EeTask::spawn("signal-handler", async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
            shutdown.send();
        })
        .detach();
    }
    {
        let shutdown = shutdown.clone();
        EeTask::spawn("graceful-shutdown", async move {
            shutdown.recv().await;
            handle.graceful_shutdown(Some(GRACE_PERIOD));
        })
        .detach();
    }

    join_static_tasks(tasks, shutdown, SHUTDOWN_TIMEOUT).await;
    Ok(())
}
