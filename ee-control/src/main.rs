//! The easy-enclave control plane.
//!
//! Terminates RA-TLS, speaks the agent control channel over WebSocket,
//! serves the public resolve/proxy surface and the operator API, and runs
//! the health watchdog.

mod allowlist;
mod config;
mod policy;
mod proxy;
mod registry;
mod server;
mod session;
mod state;
mod tunnels;
mod watchdog;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use ee_attest::{
    provider::{ConfigfsTsm, FakeQuoteProvider, QuoteProvider},
    ratls::{RatlsStore, DEFAULT_COMMON_NAME},
    tls::{server_config, RatlsCertVerifier},
};
use ee_common::{
    shutdown::ShutdownSignal,
    task::{join_static_tasks, EeTask},
};
use tracing::{error, info};

use crate::{config::Config, state::ControlPlane};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(8);
const GRACE_PERIOD: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ee_logger::init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let config = Config::from_env();
    let control_addr: SocketAddr = format!("{}:{}", config.bind, config.control_port)
        .parse()
        .context("Bad control bind address")?;
    let proxy_addr: SocketAddr = format!("{}:{}", config.proxy_bind, config.proxy_port)
        .parse()
        .context("Bad proxy bind address")?;

    let state = Arc::new(ControlPlane::new(config)?);
    let shutdown = ShutdownSignal::new();
    let mut tasks = Vec::new();

    // Control listener, RA-TLS terminated when enabled.
    let control_router = server::control_router(state.clone());
    let control_handle = axum_server::Handle::new();
    if state.config.ratls_enabled {
        let provider: Box<dyn QuoteProvider> = if state.config.ratls_allow_fake_quote {
            Box::new(FakeQuoteProvider)
        } else {
            Box::new(ConfigfsTsm::new())
        };
        let ratls = RatlsStore::new(
            provider,
            DEFAULT_COMMON_NAME,
            state.config.ratls_cert_ttl,
            Some(state.config.ratls_dir.clone()),
        );
        let material = ratls.ensure().context("Failed to produce RA-TLS material")?;
        let client_verifier = state
            .config
            .ratls_require_client_cert
            .then(|| Arc::new(RatlsCertVerifier::new(state.config.ratls_allow_fake_quote)));
        let tls =
            server_config(&material, client_verifier).context("Bad RA-TLS server config")?;
        let rustls_config = RustlsConfig::from_config(Arc::new(tls));

        info!("control listener (ra-tls) on https://{control_addr}");
        let handle = control_handle.clone();
        tasks.push(EeTask::spawn("control-server", async move {
            let result = axum_server::bind_rustls(control_addr, rustls_config)
                .handle(handle)
                .serve(control_router.into_make_service())
                .await;
            if let Err(e) = result {
                error!("control server failed: {e}");
            }
        }));
    } else {
        info!("control listener on http://{control_addr}");
        let handle = control_handle.clone();
        tasks.push(EeTask::spawn("control-server", async move {
            let result = axum_server::bind(control_addr)
                .handle(handle)
                .serve(control_router.into_make_service())
                .await;
            if let Err(e) = result {
                error!("control server failed: {e}");
            }
        }));
    }

    // Edge proxy listener.
    let edge_router = proxy::edge_router(state.clone());
    let proxy_handle = axum_server::Handle::new();
    info!("edge proxy on http://{proxy_addr}");
    {
        let handle = proxy_handle.clone();
        tasks.push(EeTask::spawn("edge-proxy", async move {
            let result = axum_server::bind(proxy_addr)
                .handle(handle)
                .serve(edge_router.into_make_service())
                .await;
            if let Err(e) = result {
                error!("edge proxy failed: {e}");
            }
        }));
    }

    // Health watchdog.
    tasks.push(EeTask::spawn(
        "health-watchdog",
        watchdog::run(state.clone(), shutdown.clone()),
    ));

    // Ctrl-C begins a graceful shutdown of every listener.
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
            control_handle.graceful_shutdown(Some(GRACE_PERIOD));
            proxy_handle.graceful_shutdown(Some(GRACE_PERIOD));
        })
        .detach();
    }

    join_static_tasks(tasks, shutdown, SHUTDOWN_TIMEOUT).await;
    Ok(())
}
