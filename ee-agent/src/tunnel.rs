//! The tunnel client: the agent half of the control-channel state machine.
//!
//! Dials the control plane over WebSocket (RA-TLS when the URL is `wss`),
//! registers, answers attestation challenges with fresh local attestations,
//! services `proxy_request` frames against the local backend, and heartbeats
//! `health{pass}`. Reconnects forever with a fixed delay.

use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use ee_api::tunnel::{
    AttestResponse, Health, ProxyRequest, ProxyResponse, Register, TunnelFrame,
};
use ee_attest::{
    ratls::{RatlsStore, DEFAULT_COMMON_NAME},
    tls::{client_config, RatlsCertVerifier},
};
use ee_common::shutdown::ShutdownSignal;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    Connector,
};
use tracing::{info, warn};

use crate::{attestation::build_attestation, server::SharedState};

pub async fn run(state: SharedState, shutdown: ShutdownSignal) {
    let ws_url = match &state.config.control_ws {
        Some(url) => url.clone(),
        None => {
            info!("EE_CONTROL_WS not set; tunnel client disabled");
            shutdown.recv().await;
            return;
        }
    };
    if state.config.repo.is_empty()
        || state.config.release_tag.is_empty()
        || state.config.app_name.is_empty()
    {
        warn!("EE_REPO, EE_RELEASE_TAG, and EE_APP_NAME are required for the tunnel");
        shutdown.recv().await;
        return;
    }

    let ratls = RatlsStore::new(
        provider_for_tls(&state),
        DEFAULT_COMMON_NAME,
        state.config.ratls_cert_ttl,
        Some(state.config.ratls_dir.clone()),
    );

    loop {
        let connect = connect_once(&state, &ws_url, &ratls, &shutdown);
        tokio::select! {
            () = shutdown.recv() => break,
            result = connect => {
                if let Err(e) = result {
                    warn!("tunnel error: {e:#}");
                }
            }
        }
        tokio::select! {
            () = shutdown.recv() => break,
            () = tokio::time::sleep(state.config.reconnect_delay) => {}
        }
    }
}

fn provider_for_tls(
    state: &SharedState,
) -> Box<dyn ee_attest::provider::QuoteProvider> {
    if state.config.ratls_allow_fake_quote {
        Box::new(ee_attest::provider::FakeQuoteProvider)
    } else {
        Box::new(ee_attest::provider::ConfigfsTsm::new())
    }
}

async fn connect_once(
    state: &SharedState,
    ws_url: &str,
    ratls: &RatlsStore,
    shutdown: &ShutdownSignal,
) -> anyhow::Result<()> {
    let request = ws_url
        .into_client_request()
        .context("Bad control WebSocket URL")?;

    let connector = if ws_url.starts_with("wss://") {
        let material = ratls.ensure().context("RA-TLS material unavailable")?;
        let verifier = Arc::new(RatlsCertVerifier::new(state.config.ratls_allow_fake_quote));
        let tls = client_config(verifier, Some(&material))
            .context("Bad RA-TLS client config")?;
        Some(Connector::Rustls(Arc::new(tls)))
    } else {
        None
    };

    let (socket, _response) = connect_async_tls_with_config(request, None, false, connector)
        .await
        .context("Control plane connection failed")?;
    info!("tunnel connected to {ws_url}");
    let (mut ws_tx, mut ws_rx) = socket.split();

    let register = TunnelFrame::Register(Register {
        repo: state.config.repo.clone(),
        release_tag: state.config.release_tag.clone(),
        app_name: state.config.app_name.clone(),
        agent_id: state.config.agent_id.clone(),
        network: state.config.network.clone(),
        tunnel_version: Some("1".to_owned()),
    });
    send_frame(&mut ws_tx, &register).await?;

    let mut health_ticker = tokio::time::interval(state.config.health_interval);
    health_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    health_ticker.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            () = shutdown.recv() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = health_ticker.tick() => {
                send_frame(&mut ws_tx, &health_frame()).await?;
            }
            incoming = ws_rx.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(e).context("Socket error"),
                    None => anyhow::bail!("control plane closed the tunnel"),
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => anyhow::bail!("control plane closed the tunnel"),
                    _ => continue,
                };
                let frame: TunnelFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("unparseable frame from control plane: {e}");
                        continue;
                    }
                };
                handle_frame(state, &mut ws_tx, frame).await?;
            }
        }
    }
}

async fn handle_frame<S>(
    state: &SharedState,
    ws_tx: &mut S,
    frame: TunnelFrame,
) -> anyhow::Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    match frame {
        TunnelFrame::AttestRequest(challenge) => {
            let response = match build_attestation(&state.config, state.provider.as_ref())
            {
                Ok(payload) => AttestResponse {
                    nonce: challenge.nonce,
                    quote: Some(payload.quote),
                    report_data: Some(payload.report_data),
                    measurements: serde_json::to_value(&payload.measurements)
                        .ok()
                        .and_then(|value| value.as_object().cloned()),
                },
                Err(e) => {
                    warn!("attestation build failed: {e:#}");
                    AttestResponse {
                        nonce: challenge.nonce,
                        quote: None,
                        report_data: None,
                        measurements: None,
                    }
                }
            };
            send_frame(ws_tx, &TunnelFrame::AttestResponse(response)).await?;
        }
        TunnelFrame::ProxyRequest(request) => {
            let response = proxy_to_backend(state, request).await;
            send_frame(ws_tx, &TunnelFrame::ProxyResponse(response)).await?;
            // A served request is proof of life.
            send_frame(ws_tx, &health_frame()).await?;
        }
        TunnelFrame::Status(status) => {
            info!(state = %status.state, reason = %status.reason, "tunnel status");
        }
        _ => {}
    }
    Ok(())
}

fn health_frame() -> TunnelFrame {
    TunnelFrame::Health(Health {
        status: "pass".to_owned(),
    })
}

/// Perform the bridged request against the local backend. Failures map to
/// a synthesized 502 so the control plane always gets a response frame.
async fn proxy_to_backend(state: &SharedState, request: ProxyRequest) -> ProxyResponse {
    match try_proxy(state, &request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("backend request failed: {e:#}");
            ProxyResponse {
                request_id: request.request_id,
                status: 502,
                headers: Default::default(),
                body_b64: base64::engine::general_purpose::STANDARD
                    .encode(r#"{"error":"backend_unreachable"}"#),
            }
        }
    }
}

async fn try_proxy(
    state: &SharedState,
    request: &ProxyRequest,
) -> anyhow::Result<ProxyResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .context("Bad method in proxy request")?;
    let base = state.config.backend_url.trim_end_matches('/');
    let path = if request.path.starts_with('/') {
        request.path.clone()
    } else {
        format!("/{}", request.path)
    };
    let url = format!("{base}{path}");

    let body = if request.body_b64.is_empty() {
        Vec::new()
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(&request.body_b64)
            .context("Bad body encoding in proxy request")?
    };

    let mut backend_request = state.http.request(method, &url).body(body);
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        backend_request = backend_request.header(name, value);
    }

    let response = backend_request.send().await.context("Backend unreachable")?;
    let status = response.status().as_u16();
    let mut headers = std::collections::BTreeMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_owned(), value.to_owned());
        }
    }
    let body = response.bytes().await.context("Backend body read failed")?;

    Ok(ProxyResponse {
        request_id: request.request_id.clone(),
        status,
        headers,
        body_b64: base64::engine::general_purpose::STANDARD.encode(&body),
    })
}

async fn send_frame<S>(ws_tx: &mut S, frame: &TunnelFrame) -> anyhow::Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(frame).expect("frames always serialize");
    ws_tx
        .send(Message::Text(json.into()))
        .await
        .context("Tunnel send failed")
}
